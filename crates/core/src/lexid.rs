//! Lexicographic order keys.
//!
//! A key is a base-36 fraction written with `0-9a-z`, most significant
//! digit first and never ending in `0`. Comparing two keys as strings
//! compares the fractions, so a key between any two others always exists
//! and inserting never renumbers neighbours.

use heart_api::*;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BASE: u8 = 36;

fn decode(key: &str) -> HeartResult<Vec<u8>> {
    let out = key
        .bytes()
        .map(|c| {
            DIGITS
                .iter()
                .position(|d| *d == c)
                .map(|p| p as u8)
                .ok_or_else(|| {
                    HeartError::bad_input(format!("bad lexid char in {key:?}"))
                })
        })
        .collect::<HeartResult<Vec<u8>>>()?;
    if out.last() == Some(&0) {
        return Err(HeartError::bad_input(format!(
            "lexid {key:?} ends in zero"
        )));
    }
    Ok(out)
}

fn encode(digits: &[u8]) -> String {
    digits.iter().map(|d| DIGITS[*d as usize] as char).collect()
}

/// Digits strictly between `a` and `b`; `b == None` is the upper end.
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Vec<u8> {
    if let Some(b) = b {
        let n = b
            .iter()
            .enumerate()
            .take_while(|(i, d)| a.get(*i).copied().unwrap_or(0) == **d)
            .count();
        if n > 0 {
            let mut out = b[..n].to_vec();
            out.extend(midpoint(a.get(n..).unwrap_or(&[]), Some(&b[n..])));
            return out;
        }
    }
    let da = a.first().copied().unwrap_or(0);
    let db = b.and_then(|b| b.first().copied()).unwrap_or(BASE);
    if db - da > 1 {
        return vec![(da + db).div_ceil(2)];
    }
    match b {
        Some(b) if b.len() > 1 => vec![b[0]],
        _ => {
            let mut out = vec![da];
            out.extend(midpoint(a.get(1..).unwrap_or(&[]), None));
            out
        }
    }
}

/// The key in the middle of the whole range.
pub fn middle() -> String {
    encode(&midpoint(&[], None))
}

/// A key after `prev`, as short as possible.
pub fn next(prev: &str) -> HeartResult<String> {
    let prev = decode(prev)?;
    let mut out = Vec::new();
    for d in prev.iter() {
        if *d < BASE - 1 {
            out.push(d + 1);
            return Ok(encode(&out));
        }
        out.push(*d);
    }
    out.extend(midpoint(&[], None));
    Ok(encode(&out))
}

/// A key before `next`.
pub fn prev(next: &str) -> HeartResult<String> {
    let next = decode(next)?;
    if next.is_empty() {
        return Err(HeartError::bad_input("nothing sorts before the empty lexid"));
    }
    Ok(encode(&midpoint(&[], Some(&next))))
}

/// A key strictly between `prev` and `next`.
pub fn next_before(prev: &str, next: &str) -> HeartResult<String> {
    if prev >= next {
        return Err(HeartError::bad_input(format!(
            "lexid {prev:?} does not sort before {next:?}"
        )));
    }
    let (a, b) = (decode(prev)?, decode(next)?);
    Ok(encode(&midpoint(&a, Some(&b))))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn middle_and_neighbours() {
        let m = middle();
        assert_eq!("i", m);
        let n = next(&m).unwrap();
        let p = prev(&m).unwrap();
        assert!(p < m && m < n);
    }

    #[test]
    fn next_grows_slowly() {
        let mut k = middle();
        for _ in 0..200 {
            let n = next(&k).unwrap();
            assert!(n > k, "{n} > {k}");
            k = n;
        }
        assert!(k.len() < 16, "{k}");
    }

    #[test]
    fn insert_between_repeatedly() {
        let a = middle();
        let mut b = next(&a).unwrap();
        for _ in 0..100 {
            let m = next_before(&a, &b).unwrap();
            assert!(a < m && m < b, "{a} < {m} < {b}");
            assert!(!m.ends_with('0'));
            b = m;
        }
    }

    #[test]
    fn prev_repeatedly() {
        let mut k = middle();
        for _ in 0..100 {
            let p = prev(&k).unwrap();
            assert!(p < k, "{p} < {k}");
            assert!(!p.ends_with('0'));
            k = p;
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert!(next_before("b", "a").unwrap_err().is(ErrorKind::BadInput));
        assert!(next("A").is_err());
        assert!(next("a0").is_err());
    }
}
