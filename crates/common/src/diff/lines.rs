// Myers line diff.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEdit<'a> {
    Equal(&'a str),
    Insert(&'a str),
    Delete(&'a str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub added: usize,
    pub removed: usize,
}

impl LineStats {
    pub fn of(edits: &[LineEdit<'_>]) -> Self {
        edits.iter().fold(Self::default(), |mut stats, edit| {
            match edit {
                LineEdit::Insert(_) => stats.added += 1,
                LineEdit::Delete(_) => stats.removed += 1,
                LineEdit::Equal(_) => {}
            }
            stats
        })
    }
}

/// Computes a shortest edit script from `old_text` to `new_text`, line by line.
///
/// Lines keep their terminators so a missing trailing newline counts as a change.
pub fn diff_lines<'a>(old_text: &'a str, new_text: &'a str) -> Vec<LineEdit<'a>> {
    let old_lines: Vec<&str> = old_text.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new_text.split_inclusive('\n').collect();
    myers_edits(&old_lines, &new_lines)
}

fn myers_edits<'a>(old_lines: &[&'a str], new_lines: &[&'a str]) -> Vec<LineEdit<'a>> {
    let old_len = old_lines.len();
    let new_len = new_lines.len();

    if old_len == 0 {
        return new_lines.iter().copied().map(LineEdit::Insert).collect();
    }
    if new_len == 0 {
        return old_lines.iter().copied().map(LineEdit::Delete).collect();
    }

    let max = old_len + new_len;
    let offset = max as isize;
    let mut v = vec![0isize; 2 * max + 1];
    let mut trace: Vec<Vec<isize>> = Vec::with_capacity(max + 1);
    let mut solved_d = 0usize;

    'outer: for d in 0..=max {
        trace.push(v.clone());

        let d_isize = d as isize;
        let mut k = -d_isize;
        while k <= d_isize {
            let mut x = if k == -d_isize
                || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
            {
                v[(k + 1 + offset) as usize]
            } else {
                v[(k - 1 + offset) as usize] + 1
            };
            let mut y = x - k;

            while x < old_len as isize
                && y < new_len as isize
                && old_lines[x as usize] == new_lines[y as usize]
            {
                x += 1;
                y += 1;
            }

            v[(k + offset) as usize] = x;

            if x >= old_len as isize && y >= new_len as isize {
                solved_d = d;
                break 'outer;
            }

            k += 2;
        }
    }

    backtrack(old_lines, new_lines, &trace, solved_d, offset)
}

fn backtrack<'a>(
    old_lines: &[&'a str],
    new_lines: &[&'a str],
    trace: &[Vec<isize>],
    solved_d: usize,
    offset: isize,
) -> Vec<LineEdit<'a>> {
    let mut edits = Vec::new();
    let mut x = old_lines.len() as isize;
    let mut y = new_lines.len() as isize;

    for d in (0..=solved_d).rev() {
        let v = &trace[d];
        let k = x - y;
        let d_isize = d as isize;

        let prev_k = if d == 0 {
            0
        } else if k == -d_isize
            || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { v[(prev_k + offset) as usize] };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(LineEdit::Equal(old_lines[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }

        if d == 0 {
            break;
        }

        if x == prev_x {
            edits.push(LineEdit::Insert(new_lines[(y - 1) as usize]));
            y -= 1;
        } else {
            edits.push(LineEdit::Delete(old_lines[(x - 1) as usize]));
            x -= 1;
        }
    }

    edits.reverse();
    edits
}
