use std::process::ExitCode;

fn main() -> ExitCode {
    match stereo_vr::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("hellovr: {}", e);
            ExitCode::FAILURE
        }
    }
}
