fn main() {
    if let Err(err) = wall_clock_in::app::run_probe() {
        eprintln!("status probe failed: {err}");
        std::process::exit(1);
    }
}
