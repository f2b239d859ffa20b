pub mod coherence;
pub mod sim;
pub mod timeq;
