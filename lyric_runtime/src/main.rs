use clap::{Parser, Subcommand};
use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use lyric_runtime::{
    AbstractLoader, Address, BytecodeBuilder, BytecodeDecoder, BytecodeInterpreter,
    CORE_PLUGIN_LOCATION, CallDescriptor, CallMode, ChainLoader, CoreTrap, DeclFlags,
    DirectoryLoader, ENTRY_SYMBOL, ImportFlags, InterpreterState, InterpreterStateOptions,
    LOAD_ARGUMENT, LOAD_LOCAL, LinkageSection, MemoryLoader, ModuleBuilder, ObjectFile, Op,
    PRELUDE_LOCATION, ProcHeader, Result, STORE_ARGUMENT, STORE_LOCAL, build_prelude,
    core_plugin,
};

const DEMO_LOCATION: &str = "/demo";

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs Lyric assemblies", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the `$entry` of an assembly
    Run {
        /// Assembly location, e.g. `/app/main`
        location: String,

        /// Directory holding the `.lyo` files
        #[arg(long, default_value = ".")]
        search: PathBuf,

        /// Arguments handed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Build and run a small factorial program
    Demo {
        /// Also write the demo assembly to this directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the sections and the decoded bytecode of a `.lyo` file
    Dump { file: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let outcome = match cli.command {
        Command::Run {
            location,
            search,
            args,
        } => run(&location, search, args),
        Command::Demo { out } => demo(out),
        Command::Dump { file } => {
            dump(&file);
            return;
        }
    };
    if let Err(status) = outcome {
        eprintln!("error: {status}");
        process::exit(1);
    }
}

/// The prelude always comes from memory; everything else from `search`.
fn mk_loader(search: PathBuf) -> Arc<dyn AbstractLoader> {
    let builtin = MemoryLoader::new();
    builtin.insert_object(PRELUDE_LOCATION, &build_prelude());
    builtin.insert_plugin(core_plugin());
    let disk = DirectoryLoader::new(search).with_plugin(core_plugin());
    let loaders: Vec<Arc<dyn AbstractLoader>> = vec![Arc::new(builtin), Arc::new(disk)];
    Arc::new(ChainLoader::new(loaders))
}

fn execute(
    loader: Arc<dyn AbstractLoader>,
    location: &str,
    main_arguments: Vec<String>,
) -> Result<()> {
    let options = InterpreterStateOptions {
        loader: Some(loader),
        main_arguments,
        ..Default::default()
    };
    let state = InterpreterState::create(options, location)?;
    let mut interpreter = BytecodeInterpreter::new(state, None);
    let exit = interpreter.run()?;
    log::info!("{} instructions executed", exit.instruction_count);
    println!("{}", exit.value);
    Ok(())
}

fn run(location: &str, search: PathBuf, args: Vec<String>) -> Result<()> {
    execute(mk_loader(search), location, args)
}

/// `fact(n)` computed with a loop, printed and returned for n = 10.
fn build_demo() -> ObjectFile {
    let mut m = ModuleBuilder::new();
    m.add_import(PRELUDE_LOCATION, ImportFlags::SYSTEM_BOOTSTRAP);
    m.add_plugin(CORE_PLUGIN_LOCATION);

    let mut fact = BytecodeBuilder::new();
    fact.i64(1);
    fact.store(STORE_LOCAL, 0);
    let top = fact.current_offset();
    fact.load(LOAD_ARGUMENT, 0);
    let done = fact.jump(Op::IfZero);
    fact.load(LOAD_LOCAL, 0);
    fact.load(LOAD_ARGUMENT, 0);
    fact.op(Op::I64Mul);
    fact.store(STORE_LOCAL, 0);
    fact.load(LOAD_ARGUMENT, 0);
    fact.i64(1);
    fact.op(Op::I64Sub);
    fact.store(STORE_ARGUMENT, 0);
    fact.jump_back(Op::Jump, top);
    fact.bind(done);
    fact.load(LOAD_LOCAL, 0);
    fact.return_();
    let proc_offset = m.add_proc(&ProcHeader::new(1, 1), fact);
    let fact = m.add_call(CallDescriptor {
        name: "fact".into(),
        flags: DeclFlags::empty(),
        mode: CallMode::Normal,
        receiver: None,
        proc_offset,
    });
    m.add_symbol("fact", LinkageSection::Call, fact);

    let mut entry = BytecodeBuilder::new();
    entry.i64(10);
    entry.call_static(Address::Near(fact), 1);
    entry.op(Op::Dup);
    entry.trap(0, CoreTrap::I64ToString.index());
    entry.trap(0, CoreTrap::Print.index());
    entry.return_();
    let proc_offset = m.add_proc(&ProcHeader::new(0, 0), entry);
    let entry = m.add_call(CallDescriptor {
        name: ENTRY_SYMBOL.into(),
        flags: DeclFlags::empty(),
        mode: CallMode::Normal,
        receiver: None,
        proc_offset,
    });
    m.add_symbol(ENTRY_SYMBOL, LinkageSection::Call, entry);
    m.into_object()
}

fn demo(out: Option<PathBuf>) -> Result<()> {
    let object = build_demo();
    if let Some(dir) = out {
        let path = dir.join("demo").with_extension(DirectoryLoader::EXTENSION);
        if let Err(err) = fs::write(&path, object.to_bytes()) {
            eprintln!("Error writing '{}': {}", path.display(), err);
            process::exit(1);
        }
        println!("wrote {}", path.display());
    }
    let loader = MemoryLoader::new();
    loader.insert_object(PRELUDE_LOCATION, &build_prelude());
    loader.insert_object(DEMO_LOCATION, &object);
    loader.insert_plugin(core_plugin());
    execute(Arc::new(loader), DEMO_LOCATION, Vec::new())
}

fn dump(file: &Path) {
    let bytes = match fs::read(file) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", file.display(), err);
            process::exit(1);
        }
    };
    let object = match ObjectFile::parse(&bytes) {
        Ok(object) => object,
        Err(err) => {
            eprintln!("Error parsing '{}': {}", file.display(), err);
            process::exit(1);
        }
    };

    println!("== {} ==", file.display());
    for import in &object.imports {
        println!("import {} {:?}", import.location, import.flags);
    }
    for plugin in &object.plugins {
        println!("plugin {}", plugin.location);
    }
    println!(
        "{} literals, {} types, {} fields, {} statics, {} classes, {} links",
        object.literals.len(),
        object.types.len(),
        object.fields.len(),
        object.statics.len(),
        object.classes.len(),
        object.links.len()
    );
    for symbol in &object.symbols {
        println!("symbol {} -> {} {}", symbol.path, symbol.section.name(), symbol.index);
    }

    for (index, call) in object.calls.iter().enumerate() {
        println!();
        println!("call {index} {} ({:?})", call.name, call.mode);
        let info = match ProcHeader::parse(&object.bytecode, call.proc_offset) {
            Ok(info) => info,
            Err(status) => {
                println!("  <{status}>");
                continue;
            }
        };
        println!(
            "  args={} locals={} lexicals={}",
            info.header.num_arguments,
            info.header.num_locals,
            info.header.lexicals.len()
        );
        let mut decoder = BytecodeDecoder::at(&object.bytecode[..info.code_end], info.code_start);
        loop {
            let offset = decoder.offset();
            match decoder.decode_next() {
                Some(Ok(instruction)) => println!("  {offset:6}  {instruction}"),
                Some(Err(status)) => {
                    println!("  {offset:6}  <{status}>");
                    break;
                }
                None => break,
            }
        }
    }
}
