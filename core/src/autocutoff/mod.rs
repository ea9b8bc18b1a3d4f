//! Auto-Cutoff Watcher (component L, spec.md §4.12).
//!
//! Three cooperating pieces: [`notifier`] sends the at-risk-of-liquidation
//! email alert through the external SMTP collaborator, [`liquidation`]
//! sorts a user's open orders by USD loss and closes them until the
//! margin level recovers (cascading to copy-trading followers), and
//! [`watcher`] subscribes to `portfolio_updates` and decides, per event,
//! which of the three margin-level zones a user is in.

pub mod liquidation;
pub mod notifier;
pub mod watcher;

pub use liquidation::LiquidationEngine;
pub use notifier::{AlertNotifier, LettreAlertNotifier, RecordingAlertNotifier};
pub use watcher::AutoCutoffWatcher;
