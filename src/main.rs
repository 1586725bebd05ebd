use loxvm::error::InterpretResult;
use loxvm::vm::Vm;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use std::env;
use std::fs;
use std::process::exit;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [] => run_repl(),
        [path] => run_file(path),
        _ => {
            eprintln!("Usage: loxvm [path]");
            exit(exitcode::USAGE);
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut editor = Editor::<()>::new().expect("failed to initialize line editor");
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                report_result(vm.interpret(&line));
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file '{path}': {err}");
            exit(exitcode::IOERR);
        }
    };

    let mut vm = Vm::new();
    let result = vm.interpret(&source);
    let code = exit_code_for(&result);
    report_result(result);
    if code != exitcode::OK {
        exit(code);
    }
}

fn exit_code_for(result: &InterpretResult) -> i32 {
    match result {
        InterpretResult::Ok => exitcode::OK,
        InterpretResult::CompileError(_) => exitcode::DATAERR,
        InterpretResult::RuntimeError(_) => exitcode::SOFTWARE,
    }
}

fn report_result(result: InterpretResult) {
    match result {
        InterpretResult::Ok => {}
        InterpretResult::CompileError(errors) => {
            for error in errors {
                eprintln!("{error}");
            }
        }
        InterpretResult::RuntimeError(err) => eprintln!("{err}"),
    }
}
