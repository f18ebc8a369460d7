/// Battle persistence: the store trait and its backends.
pub mod battle_store;
/// Storage error taxonomy shared by every backend.
pub mod storage;
