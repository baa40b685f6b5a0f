pub mod cleanup;
pub mod convert;
pub mod discover;
pub mod download;
pub mod extract;
pub mod plan;
pub mod run;
pub mod select;
pub mod status;
