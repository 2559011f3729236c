fn main() {
    if let Err(err) = depcheck_runner::cli::run() {
        depcheck_runner::ui::eprintln_error(&err);
        std::process::exit(depcheck_runner::exit::exit_code(&err));
    }
}
