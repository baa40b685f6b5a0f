pub mod artifacts;
pub mod budget;
pub mod commit;
pub mod lock;
pub mod runner;
pub mod state;
