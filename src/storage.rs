use macros::Persistable;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{event, Level};

pub const SESSION_ID_LENGTH: usize = 10;

pub struct Storage {}

impl Storage {
    /// read from a path to a Vec<u8>
    pub fn read(path: &Path) -> io::Result<Vec<u8>> {
        let mut f = File::open(path)?;
        let mut data = Vec::<u8>::new();
        f.read_to_end(&mut data)?;
        Ok(data)
    }

    /// write to a path, creating missing parent directories
    pub fn write(data: Vec<u8>, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buffer = File::create(path)?;
        buffer.write_all(&data[..])?;
        Ok(())
    }

    pub fn file_exists(path: &Path) -> bool {
        path.exists()
    }
}

///
/// A struct which saves itself as one JSON file inside a data directory.
/// Implemented with `#[derive(Persistable)]`.
///
pub trait Persistable: Sized {
    fn file_name() -> &'static str;
    fn save(&self, dir: &Path) -> io::Result<()>;
    fn load(dir: &Path) -> io::Result<Self>;
}

///
/// State which outlives the process: the durable session id every control
/// message and call carries, and the preferred locale.
///
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Persistable)]
pub struct SessionStore {
    pub session_id: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(skip)]
    dir: Option<PathBuf>,
}

impl SessionStore {
    /// A fresh store which is never written to disk.
    pub fn ephemeral() -> Self {
        SessionStore {
            session_id: random_session_id(),
            locale: None,
            dir: None,
        }
    }

    /// Load the store from `dir`, or create and save a new one with a fresh
    /// session id. An unreadable store is replaced.
    pub fn load_or_create(dir: &Path) -> io::Result<Self> {
        match SessionStore::load(dir) {
            Ok(mut store) => {
                store.dir = Some(dir.to_path_buf());
                Ok(store)
            }
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    event!(
                        Level::WARN,
                        "replacing unreadable {}: {}",
                        SessionStore::file_name(),
                        err
                    );
                }
                let store = SessionStore {
                    dir: Some(dir.to_path_buf()),
                    ..SessionStore::ephemeral()
                };
                store.save(dir)?;
                event!(Level::INFO, "created session {}", store.session_id);
                Ok(store)
            }
        }
    }

    pub fn set_locale(&mut self, locale: &str) -> io::Result<()> {
        self.locale = Some(locale.to_string());
        match &self.dir {
            Some(dir) => self.save(dir),
            None => Ok(()),
        }
    }
}

pub fn random_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LENGTH)
        .map(char::from)
        .collect()
}
