//! Observable types a UI subscribes to.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever event bus it uses (JSON over a socket, a
//! webview bridge, plain logs).

pub mod events;
