/// Run `attempt` up to `attempts` times (at least once), calling `pause`
/// between failures. Returns the first success or the last error.
pub fn retry<T, E>(
    attempts: u32,
    mut attempt: impl FnMut(u32) -> Result<T, E>,
    mut pause: impl FnMut(),
) -> Result<T, E> {
    let attempts = attempts.max(1);
    let mut current = 1;
    loop {
        match attempt(current) {
            Ok(value) => return Ok(value),
            Err(err) if current >= attempts => return Err(err),
            Err(_) => {
                pause();
                current += 1;
            }
        }
    }
}
