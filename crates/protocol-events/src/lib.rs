//! Run notifications for the protocol execution engine.
//!
//! Every lifecycle transition and every command status change is published
//! as a [`RunEvent`] on an [`EventBus`]. Delivery is best-effort and never
//! blocks the executor: subscribers either pull from a broadcast receiver
//! or [`EventBus::attach`] a callback that runs on its own task.
//!
//! # Example
//!
//! ```no_run
//! use protocol_events::{EventBus, EventFilter, RunEvent};
//!
//! # async fn demo() {
//! let bus: EventBus<RunEvent> = EventBus::default();
//! let _errors = bus.attach_filtered(EventFilter::new().errors_only(), |event| {
//!     eprintln!("run error: {:?}", event);
//! });
//!
//! let mut rx = bus.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("{:?}", event.kind());
//! }
//! # }
//! ```

pub mod bus;
pub mod event;
pub mod filter;

pub use bus::{EventBus, Subscription, DEFAULT_CAPACITY};
pub use event::{RunEvent, RunEventKind};
pub use filter::EventFilter;
