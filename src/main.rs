/*!
# rpc_session Command Line Interface

## Help

```bash
rpc_session help
```

## Example Usage

```bash
rpc_session listen
rpc_session call get_config '{"cfg": {"core.debug": false}}'
rpc_session track 12 13
```

## Dev

To run from source:

```bash
cargo run -- --config config listen
```
*/

use clap::{App, Arg, SubCommand};
use rpc_session::client::Client;
use rpc_session::command::{Command, CommandCallback, CommandValue};
use rpc_session::config::ClientSettings;
use rpc_session::error::ClientError;
use rpc_session::events::LogObserver;
use rpc_session::networking::api_message::FunctionCall;
use rpc_session::request::{Callback, Memoize};
use serde_json::Value;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{event, Level};

#[tokio::main]
pub async fn main() -> rpc_session::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = App::new("rpc_session")
        .about("Talks to a job server over a persistent websocket session")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("config file name"),
        )
        .subcommand(SubCommand::with_name("listen").about("connect and log server events"))
        .subcommand(
            SubCommand::with_name("call")
                .about("call one server function and print the reply")
                .arg(Arg::with_name("fname").required(true).help("function name"))
                .arg(Arg::with_name("args").help("arguments as a JSON object")),
        )
        .subcommand(
            SubCommand::with_name("track")
                .about("poll jobs until they complete and print their values")
                .arg(
                    Arg::with_name("ids")
                        .required(true)
                        .multiple(true)
                        .help("job ids"),
                ),
        )
        .get_matches();

    let config_name = matches.value_of("config").unwrap_or("config");
    let settings = ClientSettings::load(config_name)?;
    let client = Client::connect(settings, Arc::new(LogObserver)).await?;

    tokio::select! {
        res = run(&client, &matches) => {
            if let Err(err) = res {
                eprintln!("{}", err);
            }
        },
        _ = signal::ctrl_c() => {
            println!("Shutting down!")
        }
    }
    client.shutdown().await;
    Ok(())
}

async fn run(client: &Client, matches: &clap::ArgMatches<'_>) -> rpc_session::Result<()> {
    match matches.subcommand() {
        ("call", Some(call_matches)) => {
            let fname = call_matches.value_of("fname").unwrap_or_default();
            let mut call = FunctionCall::new(fname);
            if let Some(args) = call_matches.value_of("args") {
                match serde_json::from_str::<Value>(args)? {
                    Value::Object(args) => {
                        for (name, value) in args {
                            call = call.arg(&name, value);
                        }
                    }
                    other => {
                        return Err(ClientError::Protocol(format!(
                            "arguments must be a JSON object, got {}",
                            other
                        )))
                    }
                }
            }
            let (tx, mut rx) = mpsc::unbounded_channel();
            client.call_func(
                call,
                Some(Callback::plain(move |data, error| {
                    let _ = tx.send((data, error));
                })),
                Memoize::Off,
            );
            if let Some((data, error)) = rx.recv().await {
                match error {
                    Some(error) => return Err(ClientError::Application(error)),
                    None => println!("{}", data.unwrap_or(Value::Null)),
                }
            }
            Ok(())
        }
        ("track", Some(track_matches)) => {
            let ids = track_matches
                .values_of("ids")
                .into_iter()
                .flatten()
                .map(|id| {
                    id.parse::<u64>()
                        .map_err(|err| ClientError::Protocol(format!("bad job id {}: {}", id, err)))
                })
                .collect::<rpc_session::Result<Vec<u64>>>()?;
            let command = client.track(ids)?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let callback: CommandCallback = Arc::new(move |_: &Command, result: Result<(), ClientError>| {
                let _ = tx.send(result);
            });
            command.poll_until_complete(Some(callback));
            if let Some(result) = rx.recv().await {
                result?;
            }
            match command.get_value(None) {
                CommandValue::Single(value) => println!("{}", value.unwrap_or(Value::Null)),
                CommandValue::Many(values) => {
                    for (id, value) in values {
                        println!("{}: {}", id, value);
                    }
                }
            }
            Ok(())
        }
        _ => {
            event!(Level::INFO, "listening, press ctrl-c to stop");
            futures::future::pending::<()>().await;
            Ok(())
        }
    }
}
