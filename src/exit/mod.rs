// =============================================================================
// Exit management building blocks
// =============================================================================
//
// `triple_barrier` and `micro_trail` are kept as standalone, AppState-free
// state machines; `position_engine::PositionManager::evaluate_tick` folds
// their ladder/ratchet/trail idioms into the single tick-evaluation path
// that drives `UpdateInstruction`s. Neither module is wired into the
// orchestrator directly.

pub mod micro_trail;
pub mod triple_barrier;
