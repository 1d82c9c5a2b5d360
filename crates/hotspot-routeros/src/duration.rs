// RouterOS duration strings
//
// The router reports durations as unit runs (`1w2d5h10m3s`, `500ms`),
// clock form (`00:10:12`), or a mix (`2d03:04:05`). Anything unparsable
// counts as zero.

/// Parse a RouterOS duration into whole seconds. Invalid input yields `0`.
pub fn parse_routeros_duration(raw: &str) -> u64 {
    parse(raw.trim()).unwrap_or(0)
}

fn parse(s: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits_end);

        if tail.starts_with(':') {
            return total.checked_add(parse_clock(rest)?);
        }
        if number.is_empty() {
            return None;
        }
        let value: u64 = number.parse().ok()?;

        let unit_end = tail
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        let seconds = match unit {
            // bare trailing number is seconds
            "" | "s" => value,
            "m" => value.checked_mul(60)?,
            "h" => value.checked_mul(3_600)?,
            "d" => value.checked_mul(86_400)?,
            "w" => value.checked_mul(604_800)?,
            "ms" => value / 1_000,
            "us" | "ns" => 0,
            _ => return None,
        };
        total = total.checked_add(seconds)?;
        rest = next;
    }

    Some(total)
}

/// `HH:MM:SS`, `MM:SS`, optionally with a fractional second.
fn parse_clock(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m, sec] => (*h, *m, *sec),
        [m, sec] => ("0", *m, *sec),
        _ => return None,
    };
    let sec = sec.split_once('.').map_or(sec, |(whole, _)| whole);
    let field = |v: &str| -> Option<u64> {
        if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        v.parse().ok()
    };
    let (h, m, sec) = (field(h)?, field(m)?, field(sec)?);
    if m >= 60 || sec >= 60 {
        return None;
    }
    h.checked_mul(3_600)?.checked_add(m * 60 + sec)
}
