mod file;
pub use file::UringFile;
