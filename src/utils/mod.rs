// Shared utilities: logging formats, path resolution, input validation, host detection

pub mod logging;
pub mod os_detection;
pub mod path_resolver;
pub mod validation;
