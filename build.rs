use anyhow::Result;
use vergen_gitcl::{BuildBuilder, Emitter, GitclBuilder, RustcBuilder};

pub fn main() -> Result<()> {
    let build = BuildBuilder::default().build_timestamp(true).build()?;
    let gitcl = GitclBuilder::default()
        .describe(false, false, None)
        .branch(true)
        .sha(false)
        .commit_date(true)
        .build()?;
    let rustc = RustcBuilder::default().semver(true).build()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&gitcl)?
        .add_instructions(&rustc)?
        .emit()?;

    Ok(())
}
