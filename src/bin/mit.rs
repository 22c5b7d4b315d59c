use clap::Parser;
use clap_num::maybe_hex;
use mit::error::VmError;
use mit::inst::disassemble_word;
use mit::memory::Wordsize;
use mit::object;
use mit::state::State;
use mit::word::{UWord, WORD_BYTES};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Run a Mit virtual machine image
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the object file to run
    image: String,

    /// Arguments passed to the program through the argc/argv extra
    /// instructions
    args: Vec<String>,

    /// Stack capacity in words
    #[arg(long, default_value_t = 1024)]
    stack_words: usize,

    /// Memory size in bytes (rounded up to a whole number of words)
    #[arg(long, default_value_t = 0x10_0000)]
    memory_size: usize,

    /// Single step through each instruction with an interactive prompt
    #[arg(short, long)]
    debug: bool,

    /// Break on program counter match and begin debug stepping (use 0x
    /// prefix for hexadecimal)
    #[arg(short, long, value_parser=maybe_hex::<u64>)]
    breakpoint: Option<u64>,

    /// Print this 8-word memory region whenever the machine stops
    #[arg(short, long, value_parser=maybe_hex::<u64>)]
    memory: Option<u64>,
}

fn print_memory(state: &State, base: UWord) {
    for n in 0..8 {
        let addr = base + (n * WORD_BYTES) as UWord;
        match state.memory().load(addr, Wordsize::Word) {
            Ok(word) => println!("{addr:x}: {word:x}"),
            Err(_) => {
                println!("{addr:x}: <out of range>");
                break;
            }
        }
    }
}

fn print_location(state: &State) {
    let word_addr = state.pc().wrapping_sub(WORD_BYTES as UWord);
    println!("{state}");
    if state.ir() != 0 {
        println!("  {word_addr:#x}: {}", disassemble_word(state.ir()));
    }
}

/// Interactive stepper. Empty input or `s` steps, `c` continues, `m`
/// dumps memory, `q` quits.
fn debug_loop(state: &mut State, args: &Args) -> Result<(), ReadlineError> {
    let mut rl = DefaultEditor::new()?;
    loop {
        print_location(state);
        let line = match rl.readline("(mit) ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut terms = line.split_whitespace();
        match terms.next() {
            None | Some("s") | Some("step") => {
                if let Err(error) = state.single_step() {
                    report(state, error);
                    return Ok(());
                }
                if let Some(base) = args.memory {
                    print_memory(state, base as UWord);
                }
            }
            Some("c") | Some("continue") => {
                let error = state.run();
                report(state, error);
                return Ok(());
            }
            Some("m") | Some("memory") => {
                let base = terms
                    .next()
                    .and_then(|term| maybe_hex::<u64>(term).ok())
                    .or(args.memory);
                match base {
                    Some(base) => print_memory(state, base as UWord),
                    None => println!("usage: m <addr>"),
                }
            }
            Some("q") | Some("quit") => return Ok(()),
            Some(other) => println!("unknown command {other:?}"),
        }
    }
}

fn report(state: &State, error: VmError) {
    match error {
        VmError::Halt(code) => println!("halted with code {code}"),
        error => println!(
            "stopped: {error} (code {}) at pc={:#x}",
            error.code(),
            state.pc()
        ),
    }
}

fn exit_code(error: VmError) -> i32 {
    match error {
        VmError::Halt(code) => code as i32,
        error => {
            eprintln!("mit: {error} (code {})", error.code());
            1
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let memory_size = args.memory_size.next_multiple_of(WORD_BYTES);
    let mut state = State::new(memory_size, args.stack_words);

    if let Err(e) = object::load_file(&args.image, state.memory_mut(), 0) {
        eprintln!("mit: error loading {}: {e}", args.image);
        std::process::exit(1);
    }

    if !args.args.is_empty() {
        // Place the argument block in the top quarter of memory, out of
        // the image's way.
        let base = (memory_size - memory_size / 4) as UWord;
        if let Err(e) = state.load_args(base, &args.args) {
            eprintln!("mit: error installing arguments: {e}");
            std::process::exit(1);
        }
    }

    if args.debug {
        if let Err(e) = debug_loop(&mut state, &args) {
            eprintln!("mit: {e}");
            std::process::exit(1);
        }
        return;
    }

    if let Some(breakpoint) = args.breakpoint {
        loop {
            if state.pc() == breakpoint as UWord && state.ir() == 0 {
                if let Err(e) = debug_loop(&mut state, &args) {
                    eprintln!("mit: {e}");
                    std::process::exit(1);
                }
                return;
            }
            if let Err(error) = state.single_step() {
                if let Some(base) = args.memory {
                    print_memory(&state, base as UWord);
                }
                std::process::exit(exit_code(error));
            }
        }
    }

    let error = state.run();
    if let Some(base) = args.memory {
        print_memory(&state, base as UWord);
    }
    std::process::exit(exit_code(error));
}
