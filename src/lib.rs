//! Canvas collaboration core.
//!
//! ARCHITECTURE
//! ============
//! Two engines sit behind a host editor view and never talk to each other:
//!
//! - [`history::HistoryEngine`] keeps a linear undo/redo stack of whole-canvas
//!   snapshots and replays them into the bound [`canvas::CanvasDocument`].
//! - [`presence::PresenceEngine`] keeps a point-in-time view of who else is
//!   on a document, re-derived from a [`presence::PresenceStore`] every time
//!   the store's change feed fires.
//!
//! [`session::EditorSession`] is the host: it owns the canvas and the
//! document id and wires lifecycle events into both engines.

pub mod canvas;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod notify;
pub mod presence;
pub mod session;
