pub use self::{progress::*, result::*, submission::*};

mod progress;
mod result;
mod submission;
