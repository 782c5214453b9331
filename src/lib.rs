/*!
# rpc_session

rpc_session is the client side of a job-running application server. It keeps a persistent websocket session with the server, correlates replies to requests over an unordered transport and tracks long running server jobs ("commands") until their results arrive.

The pieces, leaves first:

* `poll`: cancellable repeating tasks with a timeout, used for the heartbeat, reconnect backoff and command polling.
* `cache`: time-bounded LRU memoization of idempotent calls, keyed by a BLAKE3 fingerprint of the call.
* `request`: request ids, callbacks and the memoization lookup.
* `networking`: wire messages, the websocket transport and the `Connection` protocol state machine.
* `command`: multi-id job tracking of status, progress and values.
* `client`: the facade tying the default, push and command connections together.

# Usage

```no_run
use rpc_session::client::Client;
use rpc_session::config::ClientSettings;
use rpc_session::events::LogObserver;
use rpc_session::networking::api_message::FunctionCall;
use rpc_session::request::{Callback, Memoize};
use std::sync::Arc;

# async fn run() -> rpc_session::Result<()> {
let settings = ClientSettings::load("config")?;
let client = Client::connect(settings, Arc::new(LogObserver)).await?;
client.call_func(
    FunctionCall::new("get_locales"),
    Some(Callback::plain(|data, error| println!("{:?} {:?}", data, error))),
    Memoize::Default,
);
# Ok(())
# }
```

Calls made before the server accepted the session are queued and sent in order once it does.

*/
pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod networking;
pub mod poll;
pub mod request;
pub mod storage;
pub mod util;

#[cfg(test)]
mod test_setup;
#[cfg(test)]
pub mod test_utilities;

pub type Result<T> = std::result::Result<T, error::ClientError>;
