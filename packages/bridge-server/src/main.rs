fn main() {
    if let Err(err) = lmarena_bridge::cli::run() {
        tracing::error!(error = %err, "lmarena-bridge failed");
        std::process::exit(1);
    }
}
