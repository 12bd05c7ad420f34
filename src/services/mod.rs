/// Static routing of platform events to handlers.
pub mod bus;
/// Rate-limited structural room edits.
pub mod mutator;
/// Room lifecycle driven by voice, presence and room events.
pub mod orchestrator;
/// Periodic repair of drift between memory, store and platform.
pub mod reconciliation;
/// Activity and presence interval derivation.
pub mod tracker;
/// Primary-inline, replica-deferred store writes.
pub mod writer;
