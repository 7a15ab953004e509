fn main() {
    if let Err(err) = wall_clock_in::app::run_device() {
        eprintln!("device startup failed: {err}");
        std::process::exit(1);
    }
}
