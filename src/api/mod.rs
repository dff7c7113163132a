// Entry points used by the CLI (and any other front-end)

pub mod installer;
pub mod logs;
pub mod preflight;
pub mod updates;
