pub mod control;
pub mod document;
pub mod protocol;
pub mod reconciler;
pub mod supervisor;
pub mod synth;
