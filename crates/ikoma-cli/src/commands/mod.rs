pub mod checkpoint;
pub mod run;
pub mod web;
