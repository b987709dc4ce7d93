use super::errors::WorkerError;

// Heartbeats are the dominant frame type; recognizing the empty object
// without a JSON parse keeps them off the dispatch path. Returns Ok(true)
// for a heartbeat, Ok(false) for a frame that must be parsed as a command,
// and BadPayload for brace-only garbage.
pub fn is_ping_frame(raw: &[u8]) -> Result<bool, WorkerError> {
    if raw.len() < 2 || raw.len() == 2 && raw[0] == b'{' && raw[1] == b'}' {
        // Fast case: empty object literal, no whitespace.
        return Ok(true);
    }

    // Slower case: an empty object literal surrounded by whitespace.
    let mut left_braces = 0_usize;
    let mut right_braces = 0_usize;
    for byte in raw {
        match byte {
            b'{' => left_braces += 1,
            b'}' => right_braces += 1,
            b'\t' | b'\r' | b'\n' | b' ' => continue,
            _ => return Ok(false),
        }
    }

    if left_braces <= 1 && left_braces == right_braces {
        return Ok(true);
    }

    Err(WorkerError::BadPayload)
}
