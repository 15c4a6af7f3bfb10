use std::path::PathBuf;

use comment_thread::RunOptions;

const HELP: &str = "comment-thread: load a comment thread and print it as a two-level tree.

Usage: comment-thread [OPTIONS] [SUBJECT]

  --demo               Serve the thread from the built-in demo backend
  --config <PATH>      Read configuration from PATH
  --version, -V        Show version and exit
  --help,    -h        Show this help message";

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(message) => {
            eprintln!("error: {message}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    if let Err(err) = comment_thread::run(options) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Returns `None` when a flag was handled and the program should exit.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<RunOptions>, String> {
    let mut options = RunOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("comment-thread {}", comment_thread::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--demo" => options.demo = true,
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
                options.config_file = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag {flag}")),
            subject => {
                if options.subject_id.is_some() {
                    return Err(format!("unexpected argument {subject}"));
                }
                options.subject_id = Some(subject.to_string());
            }
        }
    }
    Ok(Some(options))
}
