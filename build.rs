use std::env;
use std::process::Command;

fn main() {
    // An explicit GIT_COMMIT from the environment wins over git metadata.
    if env::var("GIT_COMMIT").is_ok() {
        println!("cargo:rerun-if-env-changed=GIT_COMMIT");
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !commit.is_empty() {
                println!("cargo:rustc-env=GIT_COMMIT={commit}");
            }
        }
        Ok(out) => {
            println!(
                "cargo:warning=git rev-parse failed with status {}, commit left unset",
                out.status
            );
        }
        Err(e) => {
            println!("cargo:warning=git unavailable ({e}), commit left unset");
        }
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=build.rs");
}
