/// Picks `take` entries out of `rows`, spread evenly across the slice.
///
/// The walk starts at `seed % len` and advances by a stride that is coprime with
/// the slice length, so every entry is visited exactly once before wrapping and
/// two calls with different seeds rarely land on neighbouring entries.
pub fn scattered_pick<T: Clone>(rows: &[T], take: usize, seed: u64) -> Vec<T> {
  let n = rows.len();
  if take == 0 || n == 0 {
    return Vec::new();
  }
  if take >= n {
    return rows.to_vec();
  }

  let mut stride = (n / take).max(2);
  while gcd(stride, n) != 1 {
    stride += 1;
  }

  let mut used = vec![false; n];
  let mut picked = Vec::with_capacity(take);
  let mut pos = (seed % n as u64) as usize;
  while picked.len() < take {
    if !used[pos] {
      used[pos] = true;
      picked.push(rows[pos].clone());
    }
    pos = (pos + stride) % n;
  }
  picked
}

fn gcd(mut a: usize, mut b: usize) -> usize {
  while b != 0 {
    let t = a % b;
    a = b;
    b = t;
  }
  a
}
