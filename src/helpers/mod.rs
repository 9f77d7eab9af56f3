pub mod sudo;
