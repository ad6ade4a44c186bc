//! Component specifications compiled into the binary.
//!
//! Deployments can load additional specs from disk; these cover the
//! components the reference drivers and the test tooling rely on.

pub const MYSQL_EXTRACTOR: &str = include_str!("specs/mysql.extractor.yaml");
pub const FILESYSTEM_CSV_EXTRACTOR: &str = include_str!("specs/filesystem.csv_extractor.yaml");
pub const FILESYSTEM_CSV_WRITER: &str = include_str!("specs/filesystem.csv_writer.yaml");
pub const SUPABASE_WRITER: &str = include_str!("specs/supabase.writer.yaml");

pub fn all() -> [&'static str; 4] {
    [
        MYSQL_EXTRACTOR,
        FILESYSTEM_CSV_EXTRACTOR,
        FILESYSTEM_CSV_WRITER,
        SUPABASE_WRITER,
    ]
}
