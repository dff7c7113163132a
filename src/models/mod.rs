// Data models shared by the engine, the backends and the front-ends

pub mod outcome;
pub mod responses;
pub mod state;
pub mod step;
