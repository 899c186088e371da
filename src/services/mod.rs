pub mod balances;
pub mod matching;
pub mod orders;
pub mod read_model;
pub mod settlement;
pub mod stop_loss;
