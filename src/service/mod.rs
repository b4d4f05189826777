pub mod egress;
pub mod groups;
pub mod hosts;
pub mod lines;
pub mod orders;
pub mod scheduler;
