use std::env;
use std::fs::File;
use std::io::{self, Write};

use filemap::{Mmap, Protection};

/// Output a file's contents to stdout. The file path must be provided as the first process
/// argument.
fn main() {
    env_logger::init();
    let path = env::args().nth(1).expect("supply a single path as the program argument");

    let file = File::open(path).unwrap();
    let mut mmap = unsafe { Mmap::map(&file, Protection::READ_ONLY).unwrap() };

    io::stdout().write_all(mmap.data()).unwrap();
    mmap.close().unwrap();
}
