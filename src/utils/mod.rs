pub mod expand;
pub mod fs_atomic;
pub mod shell;
pub mod text;
