use std::fs;
use std::io;

/// Permission bits for one `/proc/<pid>/maps` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Perms {
    fn parse(s: &str) -> Self {
        let bytes = s.as_bytes();
        Self {
            read: bytes.first() == Some(&b'r'),
            write: bytes.get(1) == Some(&b'w'),
            exec: bytes.get(2) == Some(&b'x'),
            shared: bytes.get(3) == Some(&b's'),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub path: Option<String>,
}

/// Parses the `/proc/<pid>/maps` file format (also usable on a string for
/// tests, via [`parse_maps_str`]).
pub fn parse_proc_maps(pid: i32) -> io::Result<Vec<MapEntry>> {
    let text = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps_str(&text))
}

pub fn parse_maps_str(text: &str) -> Vec<MapEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    // Format: "start-end perms offset dev inode [path]"
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

    let (start_s, end_s) = range.split_once('-')?;
    let start = u64::from_str_radix(start_s, 16).ok()?;
    let end = u64::from_str_radix(end_s, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    Some(MapEntry { start, end, perms: Perms::parse(perms), offset, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_representative_maps_line() {
        let text = "\
55a1d2c00000-55a1d2c21000 r-xp 00000000 08:01 123456 /usr/bin/cat
7f2b4a000000-7f2b4a023000 rw-p 00000000 00:00 0
7f2b4a200000-7f2b4a228000 r--p 00000000 08:01 789012 /usr/lib/x86_64-linux-gnu/libc.so.6
";
        let entries = parse_maps_str(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path.as_deref(), Some("/usr/bin/cat"));
        assert!(entries[0].perms.exec);
        assert_eq!(entries[1].path, None);
        assert_eq!(entries[2].start, 0x7f2b4a200000);
    }
}
