use clap::Parser as ClapParser;
use std::{
    fs,
    io::{self, Write},
    process,
};

use bruecke::{BitfieldPolicy, CType, Error, Ffi, ParseError, TypeArena, TypeKind};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input declaration files to register in order
    #[arg(required = false, help = "The C declaration files to register")]
    files: Vec<String>,

    /// Start REPL after loading files (default if no files)
    #[arg(long, help = "Force REPL mode after file loading")]
    repl: bool,

    /// Print registered types and functions instead of entering the REPL
    #[arg(long, help = "Dump registered types with size, alignment and layout")]
    dump_types: bool,

    /// Evaluate one constant expression against the declarations
    #[arg(long, help = "Evaluate a constant expression and print the result")]
    eval: Option<String>,

    /// Close bitfield storage units on every base type change
    #[arg(long, help = "Lay out bitfields the MSVC way")]
    msvc_bitfields: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let policy = if cli.msvc_bitfields {
        BitfieldPolicy::Msvc
    } else {
        BitfieldPolicy::Gnu
    };
    let mut ffi = Ffi::with_policy(policy);

    for filename in &cli.files {
        let source = match fs::read_to_string(filename) {
            Ok(content) => content,
            Err(err) => {
                eprintln!("Error reading file '{}': {}", filename, err);
                process::exit(1);
            }
        };
        if let Err(err) = ffi.define(&source) {
            eprintln!("{}", format_error(filename, &source, &err));
            process::exit(1);
        }
    }

    if let Some(expr) = &cli.eval {
        match ffi.eval(expr) {
            Ok(v) => println!("{v}"),
            Err(err) => {
                eprintln!("{}", format_error("<eval>", expr, &err));
                process::exit(1);
            }
        }
        return;
    }

    if cli.dump_types {
        dump_types(&ffi);
        return;
    }

    if cli.repl || cli.files.is_empty() {
        run_repl(&mut ffi);
    }
}

fn run_repl(ffi: &mut Ffi) {
    println!("bruecke declaration shell");
    println!("Type 'exit' to quit.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut input_buffer = String::new();

    loop {
        print!("> ");
        if let Err(err) = stdout.flush() {
            eprintln!("Error flushing stdout: {}", err);
            break;
        }

        input_buffer.clear();
        match stdin.read_line(&mut input_buffer) {
            Ok(0) => break,
            Ok(_) => {
                let input = input_buffer.trim();
                if input == "exit" {
                    break;
                }
                if input.is_empty() {
                    continue;
                }
                run_line(ffi, input);
            }
            Err(err) => {
                eprintln!("Error reading input: {}", err);
                break;
            }
        }
    }
}

/// One REPL line: a `:` command, or a declaration string to register.
fn run_line(ffi: &mut Ffi, input: &str) {
    let result = if let Some(rest) = input.strip_prefix(":sizeof ") {
        ffi.sizeof(rest.trim()).map(|n| n.to_string())
    } else if let Some(rest) = input.strip_prefix(":alignof ") {
        ffi.alignof(rest.trim()).map(|n| n.to_string())
    } else if let Some(rest) = input.strip_prefix(":offsetof ") {
        match split_offsetof(rest) {
            Some((spec, member)) => ffi.offsetof(spec, member).map(|n| n.to_string()),
            None => {
                eprintln!("usage: :offsetof TYPE MEMBER");
                return;
            }
        }
    } else if let Some(rest) = input.strip_prefix(":eval ") {
        ffi.eval(rest.trim()).map(|v| v.to_string())
    } else if input.starts_with(':') {
        eprintln!("unknown command; have :sizeof, :alignof, :offsetof, :eval");
        return;
    } else {
        match ffi.define(input) {
            Ok(()) => return,
            Err(err) => Err(err),
        }
    };

    match result {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("{}", format_error("<input>", input, &err)),
    }
}

/// Splits `struct point y` into the type spec and the trailing member.
fn split_offsetof(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim();
    let (spec, member) = rest.rsplit_once(char::is_whitespace)?;
    let spec = spec.trim();
    if spec.is_empty() || member.is_empty() {
        return None;
    }
    Some((spec, member))
}

fn dump_types(ffi: &Ffi) {
    let reg = ffi.registry();
    let arena = &reg.arena;

    let mut types: Vec<_> = reg.type_entries().collect();
    types.sort_by(|a, b| a.0.cmp(b.0));

    println!("-- types --");
    for (name, ct) in &types {
        let rendered = ct.name(arena).to_string();
        let size = match ct.byte_size(arena) {
            Some(n) => n.to_string(),
            None => "?".to_string(),
        };
        let align = ct.align_mask(arena) + 1;
        println!("{name:<20} {rendered:<24} size {size:>3}  align {align}");
        if let Some(lines) = layout_lines(arena, name, ct) {
            for line in lines {
                println!("{line}");
            }
        }
    }

    let mut functions: Vec<_> = reg.function_entries().collect();
    functions.sort_by(|a, b| a.0.cmp(b.0));
    if !functions.is_empty() {
        println!("-- functions --");
        for (name, ct) in &functions {
            let Some(id) = ct.info else { continue };
            println!("{name:<20} {}", arena.func(id).signature);
        }
    }
}

/// Member or enumerator lines for the entry that defines a record or
/// enum. Aliases and forward declarations get only the summary line.
fn layout_lines(arena: &TypeArena, key: &str, ct: &CType) -> Option<Vec<String>> {
    if ct.ptr_depth() > 0 || ct.is_array {
        return None;
    }
    let id = ct.info?;
    let mut lines = Vec::new();
    match ct.kind {
        TypeKind::Struct | TypeKind::Union => {
            let rec = arena.record(id);
            if rec.name != key || !rec.defined {
                return None;
            }
            for m in &rec.members {
                let name = m.name.as_deref().unwrap_or("<anon>");
                let ty = m.ctype.name(arena);
                if m.ctype.is_bitfield {
                    let lo = m.ctype.bit_offset;
                    let hi = lo + m.ctype.bit_size;
                    lines.push(format!("  +{:<4} {name}: {ty} bits {lo}..{hi}", m.offset));
                } else {
                    lines.push(format!("  +{:<4} {name}: {ty}", m.offset));
                }
            }
        }
        TypeKind::Enum => {
            let info = arena.enum_info(id);
            if info.name != key || !info.defined {
                return None;
            }
            for (name, value) in &info.constants {
                lines.push(format!("  {name} = {value}"));
            }
        }
        _ => return None,
    }
    Some(lines)
}

fn format_error(origin: &str, source: &str, err: &Error) -> String {
    match err {
        Error::Parse(p) => format_parse_error(origin, source, p),
        other => format!("Error: {}", other),
    }
}

fn format_parse_error(origin: &str, source: &str, err: &ParseError) -> String {
    let line = (err.line as usize).max(1);
    let source_line = source.lines().nth(line - 1).unwrap_or("").trim_end();
    let body = source_line.trim_start();
    let indent = source_line.len() - body.len();
    let underline_len = body.len().max(1);

    let line_num = format!("{}", line);
    let pad = " ".repeat(line_num.len());

    format!(
        "Parse error: {message}\n\
         {pad}--> {origin}:{line}\n\
         {pad} |\n\
         {line_num} | {source_line}\n\
         {pad} | {}{}\n",
        " ".repeat(indent),
        "^".repeat(underline_len),
        message = err.message,
    )
}
