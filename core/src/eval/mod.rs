mod rouge;

pub use rouge::{RougeReport, RougeScore, RougeScorer, Scorer};
