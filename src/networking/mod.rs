/*!

# Networking

## Introduction

The client talks to the server over websockets. Every frame is a JSON text message naming the event it carries:

```json
{"event": "command" | "server_call" | "exception", "data": {...}}
```

A client holds three connections: the default one (primary), `push` for notifications and `command` for job tracking. Each runs its own socket and its own session, they share the durable session id.

## Control messages (`command`)

Sent by the client:

```json
{"id": 7, "command": 1, "session_id": "a8Gk2LpQ0z"}
```

Command codes:

```text
1   connect
2   reconnect
3   disconnect
4   status
5   handshake      (+ username, password)
6   rehandshake
```

The server answers with the same id:

```json
{"id": 7, "command": 1, "status": true, "accepted": false, "guest_allowed": true, "version": "0.8.2"}
```

`status` tells whether the server considers the client connected, `accepted` whether it is logged in.

## RPC (`server_call`)

```json
{"session_id": "a8Gk2LpQ0z", "id": 8, "msg": {"session": "...", "name": "webclient", "data": [{"fname": "get_locales"}]}}
```

Replies carry the request id, the rotated session and either one value or one result per called function:

```json
{"id": 8, "msg": {"session": "...", "data": [{"fname": "get_locales", "data": {...}, "error": null}]}}
```

A reply whose data is `"Authenticated"` asks the client to send the request again under the new session.

## Exceptions (`exception`)

```json
{"error": {"code": 408, "msg": "session expired"}}
```

Code 408 means the session expired, the client answers with a rehandshake.

*/

pub mod api_message;
pub mod connection;
pub mod reconnect;
pub mod socket;
pub mod transport;
