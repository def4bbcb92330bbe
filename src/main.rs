fn main() {
    if let Err(err) = parkgenius_lib::run() {
        eprintln!("parkgenius: {err:#}");
        std::process::exit(1);
    }
}
