use nbguest::core::main::{exit_status, run_nbguest};

fn main() {
    let status = exit_status(run_nbguest(std::env::args_os().collect()));
    std::process::exit(status);
}
