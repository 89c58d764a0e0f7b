pub mod disk;
pub mod launch_spec;
pub mod lifecycle;
pub mod logs;
