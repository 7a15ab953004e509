fn main() {
    if let Err(err) = wall_clock_in::app::run_device() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
