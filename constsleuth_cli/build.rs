use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=../.git/HEAD");

    let git_hash = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok());

    let Some(git_hash) = git_hash else {
        return;
    };
    println!("cargo:rustc-env=GIT_HASH={}", git_hash.trim());

    if Command::new("git")
        .args(["diff-index", "--quiet", "HEAD"])
        .status()
        .ok()
        .map(|status| !status.success())
        .unwrap_or(false)
    {
        println!("cargo:rustc-env=GIT_DIRTY=true");
    }
}
