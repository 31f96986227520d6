use anyhow::Result;
use vergen::EmitBuilder;

pub fn main() -> Result<()> {
    if EmitBuilder::builder()
        .git_sha(true)
        .fail_on_error()
        .emit()
        .is_err()
    {
        // only the short sha is injected, builds outside a git checkout
        // fall back to a placeholder
        println!("cargo:rustc-env=VERGEN_GIT_SHA=unknown");
    }
    Ok(())
}
