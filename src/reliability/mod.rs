pub mod circuit;
pub mod journal;
pub mod rate;
