//! codegraph CLI binary.
//!
//! The entrypoint stays minimal: all logic is in the library, and
//! `cli::run()` handles its own output including errors.

fn main() {
    let code = codegraph::cli::run();
    if code != codegraph::ExitCode::SUCCESS {
        std::process::exit(code.as_i32());
    }
}
