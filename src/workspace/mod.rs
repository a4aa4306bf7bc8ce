//! Working directory shared by the stages of one job row.
//!
//! - **Working directory** (`working_dir`): fixed `data/` + `tmp/` layout,
//!   stage hand-over tokens, permission normalization, removal
//! - **Archive** (`archive`): debug-mode tarballs of stage data

pub mod archive;
pub mod working_dir;

pub use archive::{archive_directory, stage_archive_name};
pub use working_dir::{
    PermissionNormalizer, StageInput, StageOutput, WorkingDirectory, CONFIG_FILE, STATE_FILE,
};
