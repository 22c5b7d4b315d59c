use std::fs::File;

use clap::Parser;
use itertools::Itertools;
use mit::inst::disassemble_word;
use mit::memory::{Memory, Wordsize};
use mit::object;
use mit::word::{UWord, WORD_BYTES};

/// Print the header, contents and disassembly of a Mit object file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the object file to dump
    image: String,

    /// Skip the disassembly listing
    #[arg(long)]
    no_disassembly: bool,
}

fn hexdump(memory: &Memory, length: usize) {
    for (row, chunk) in memory.bytes()[..length].chunks(16).enumerate() {
        let bytes = chunk.iter().map(|byte| format!("{byte:02x}")).join(" ");
        println!("{:08x}  {bytes}", row * 16);
    }
}

fn disassemble(memory: &Memory, base: UWord, length: usize) {
    for offset in (0..length).step_by(WORD_BYTES) {
        let addr = offset as UWord;
        let word = memory
            .load(addr, Wordsize::Word)
            .expect("image words were just loaded");
        println!(
            "{:08x}  {word:0width$x}  {}",
            base as usize + offset,
            disassemble_word(word),
            width = 2 * WORD_BYTES,
        );
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut file = match File::open(&args.image) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("mit-dump: cannot open {}: {e}", args.image);
            std::process::exit(1);
        }
    };
    let header = match object::read_header(&mut file) {
        Ok(header) => header,
        Err(e) => {
            eprintln!("mit-dump: {}: {e}", args.image);
            std::process::exit(1);
        }
    };
    println!(
        "{}: {}-bit image, base {:#x}, {} bytes",
        args.image,
        8 * header.word_bytes as usize,
        header.base,
        header.length
    );

    let size = usize::try_from(header.length)
        .unwrap_or(0)
        .next_multiple_of(WORD_BYTES);
    let mut memory = Memory::new(size);
    drop(file);
    let length = match object::load_file(&args.image, &mut memory, 0) {
        Ok(length) => length as usize,
        Err(e) => {
            eprintln!("mit-dump: {}: {e}", args.image);
            std::process::exit(1);
        }
    };

    hexdump(&memory, length);
    if !args.no_disassembly {
        println!();
        disassemble(&memory, header.base, length);
    }
}
