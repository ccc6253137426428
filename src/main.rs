use clap::Parser;

fn main() {
    let cli = barque::cli::Cli::parse();
    if let Err(error) = barque::cli::run(cli) {
        eprintln!("barque: {error}");
        std::process::exit(1);
    }
}
