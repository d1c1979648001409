#![warn(clippy::all)]

use jsvmp::codegen::disassemble;
use jsvmp::diagnostic::{ansi::AnsiRenderer, json, Diagnostic};
use jsvmp::{
    compile, default_builtins, pack_plain, pack_protected, run_protected, run_vm, unpack_plain,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Ansi,
    Text,
    Json,
}

/// Scan args for --json/-j, --text/-t, --ansi/-a. Return (mode, remaining_args).
/// Multiple format flags → error + exit(1).
fn detect_output_mode(args: Vec<String>) -> (OutputMode, Vec<String>) {
    let mut mode: Option<OutputMode> = None;
    let mut remaining = Vec::with_capacity(args.len());
    let mut conflict = false;

    for arg in args {
        match arg.as_str() {
            "--json" | "-j" => {
                if mode.is_some() { conflict = true; } else { mode = Some(OutputMode::Json); }
            }
            "--text" | "-t" => {
                if mode.is_some() { conflict = true; } else { mode = Some(OutputMode::Text); }
            }
            "--ansi" | "-a" => {
                if mode.is_some() { conflict = true; } else { mode = Some(OutputMode::Ansi); }
            }
            _ => remaining.push(arg),
        }
    }

    if conflict {
        eprintln!("error: --json, --text, and --ansi are mutually exclusive");
        std::process::exit(1);
    }

    let resolved = mode.unwrap_or_else(|| {
        // Auto-detect: isatty(stderr) && !NO_COLOR → Ansi; isatty && NO_COLOR → Text; !isatty → Json
        // SAFETY: isatty(2) is always safe to call with any fd value; it returns 0 on
        // error or if the fd is not a terminal. STDERR_FILENO is a well-known constant.
        let is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } != 0;
        let no_color = std::env::var("NO_COLOR").is_ok();
        if is_tty && !no_color {
            OutputMode::Ansi
        } else if is_tty {
            OutputMode::Text
        } else {
            OutputMode::Json
        }
    });

    (resolved, remaining)
}

fn report_diagnostic(d: &Diagnostic, mode: OutputMode) {
    let s = match mode {
        OutputMode::Ansi => AnsiRenderer { use_color: true }.render(d),
        OutputMode::Text => AnsiRenderer { use_color: false }.render(d),
        // JSON mode: one object per line (NDJSON) so multiple errors are parseable.
        OutputMode::Json => format!("{}\n", json::render(d)),
    };
    eprint!("{s}");
}

fn fail(d: Diagnostic, mode: OutputMode) -> ! {
    report_diagnostic(&d, mode);
    std::process::exit(1);
}

fn usage() {
    eprintln!("Usage: jsvmp <file-or-code> [--protect | --emit <image|vmp|asm> | --dump]");
    eprintln!("       jsvmp --run-image <hex-or-file>   Run a plain hex image");
    eprintln!("       jsvmp --run-vmp <hex-or-file>     Run a protected hex image");
    eprintln!("       jsvmp help | -h                   Show usage and examples");
}

fn help() {
    println!("jsvmp — a tiny language on a protected stack VM\n");
    println!("Usage:");
    println!("  jsvmp <code>                      Compile and run inline code");
    println!("  jsvmp <file.js>                   Compile and run a file");
    println!("  jsvmp <code> --protect            Pack protected, then run the image");
    println!("  jsvmp <code> --emit image         Print the plain hex image");
    println!("  jsvmp <code> --emit vmp           Print the protected hex image");
    println!("  jsvmp <code> --emit asm           Print a bytecode listing");
    println!("  jsvmp <code> --dump               Print the compiled program as JSON");
    println!("  jsvmp --run-image <hex-or-file>   Run a plain image");
    println!("  jsvmp --run-vmp <hex-or-file>     Run a protected image\n");
    println!("Output format (errors):");
    println!("  --ansi / -a   Force ANSI colour output (default when stderr is a TTY)");
    println!("  --text / -t   Force plain text output (no colour)");
    println!("  --json / -j   Force JSON output (default when stderr is not a TTY)");
    println!("  NO_COLOR=1    Disable colour (same as --text)\n");
    println!("Examples:");
    println!("  jsvmp 'print(1 + 2);'");
    println!("  jsvmp 'function f(x){{ return x * 10; }} print(f(4));' --protect");
    println!("  jsvmp 'let a = 1;' --emit asm");
}

/// If the argument names an existing file, read it; otherwise treat the
/// argument itself as the payload.
fn arg_or_file_contents(arg: &str) -> String {
    if std::path::Path::new(arg).is_file() {
        match std::fs::read_to_string(arg) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reading {arg}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        arg.to_string()
    }
}

fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    let (mode, args) = detect_output_mode(raw_args);

    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "--version" | "-V" => {
            println!("jsvmp {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        "help" | "--help" | "-h" => {
            help();
            return;
        }
        "--run-image" | "--run-vmp" => {
            let Some(target) = args.get(2) else {
                usage();
                std::process::exit(1);
            };
            let image = arg_or_file_contents(target);
            let image = image.trim();
            if args[1] == "--run-vmp" {
                if let Err(e) = run_protected(image, &default_builtins()) {
                    fail(Diagnostic::from(&e), mode);
                }
            } else {
                match unpack_plain(image) {
                    Ok(program) => {
                        if let Err(e) = run_vm(&program, &default_builtins()) {
                            fail(Diagnostic::from(&e), mode);
                        }
                    }
                    Err(e) => fail(Diagnostic::from(&e), mode),
                }
            }
            return;
        }
        _ => {}
    }

    let source = arg_or_file_contents(&args[1]);

    let program = match compile(&source) {
        Ok(p) => p,
        Err(e) => fail(Diagnostic::from(&e).with_source(source.clone()), mode),
    };

    match args.get(2).map(String::as_str) {
        None => {
            if let Err(e) = run_vm(&program, &default_builtins()) {
                fail(Diagnostic::from(&e), mode);
            }
        }
        Some("--protect") => {
            let image = match pack_protected(&program) {
                Ok(image) => image,
                Err(e) => fail(Diagnostic::from(&e), mode),
            };
            if let Err(e) = run_protected(&image, &default_builtins()) {
                fail(Diagnostic::from(&e), mode);
            }
        }
        Some("--emit") => match args.get(3).map(String::as_str) {
            Some("image") => println!("{}", pack_plain(&program)),
            Some("vmp") => match pack_protected(&program) {
                Ok(image) => println!("{image}"),
                Err(e) => fail(Diagnostic::from(&e), mode),
            },
            Some("asm") => print!("{}", disassemble(&program)),
            _ => {
                eprintln!("error: --emit expects one of: image, vmp, asm");
                std::process::exit(1);
            }
        },
        Some("--dump") => {
            let dump = serde_json::to_string_pretty(&program)
                .unwrap_or_else(|_| "{}".to_string());
            println!("{dump}");
        }
        Some(other) => {
            eprintln!("error: unknown mode '{other}'");
            usage();
            std::process::exit(1);
        }
    }
}
