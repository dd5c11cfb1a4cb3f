pub mod calculator;

pub use calculator::{calculate_line_movements, summarize};
