use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    watch_git_head();
    println!("cargo:rustc-env=GIT_HASH={}", short_hash().unwrap_or_else(|| "unknown".into()));
}

/// Rebuild when HEAD moves to another branch or the current branch gets a commit
fn watch_git_head() {
    let head = Path::new(".git/HEAD");
    if !head.exists() {
        return;
    }
    println!("cargo:rerun-if-changed=.git/HEAD");

    let Ok(content) = std::fs::read_to_string(head) else {
        return;
    };
    if let Some(reference) = content.strip_prefix("ref: ") {
        let ref_path = Path::new(".git").join(reference.trim());
        if ref_path.exists() {
            println!("cargo:rerun-if-changed={}", ref_path.display());
        }
    }
}

fn short_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?;
    Some(hash.trim().to_string())
}
