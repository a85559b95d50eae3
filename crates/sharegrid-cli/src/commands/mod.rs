pub mod check;
pub mod put;
