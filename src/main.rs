fn main() {
    if let Err(err) = tabular_import::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
