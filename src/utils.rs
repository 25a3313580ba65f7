/// Write `e` followed by every error in its `source` chain. Used to implement
/// `Debug` for our error enums, so that logs show the root cause (e.g. the
/// sqlite message) instead of just the top-level variant.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}
