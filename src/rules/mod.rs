//! Rules deciding when the bot speaks

pub mod decision;

pub use decision::{Chance, Decision, DecisionEngine, Signals, Stage, ThreadChance, Verdict};
