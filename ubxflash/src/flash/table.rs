//! Flash organization table.
//!
//! Parallel NOR devices do not describe their sector layout, so the layout
//! is looked up by JEDEC manufacturer and device id. Table format:
//!
//! ```text
//! [FLASH]
//! ; manufacturer-device = <count>x<KiB> {, <count>x<KiB>}
//! 0x0001-0x2270 = 7x64, 1x32, 2x8, 1x16   ; AMD AM29SL400T
//! ```

use {
    crate::{
        error::{Error, Result},
        flash::geometry::{BlockDef, FlashLayout},
    },
    log::debug,
    std::{fs, path::Path},
};

/// Compiled-in table used when no table file is given.
pub const BUILTIN_TABLE: &str = "\
[FLASH]
; ---- parallel flash, 1.8V ----
; amd / spansion
0x0001-0x2270 = 7x64, 1x32, 2x8, 1x16   ; AMD AM29SL400T 4 Mbit top
0x0001-0x22F1 = 1x16, 2x8, 1x32, 7x64   ; AMD AM29SL400B 4 Mbit bottom
0x0001-0x22EA = 15x64, 1x32, 2x8, 1x16  ; AMD AM29SL800T 8 Mbit top
0x0001-0x226B = 1x16, 2x8, 1x32, 15x64  ; AMD AM29SL800B 8 Mbit bottom
0x0001-0x22E4 = 31x64, 8x8              ; AMD AM29SL160T 16 Mbit top
0x0001-0x22E7 = 8x8, 31x64              ; AMD AM29SL160B 16 Mbit bottom
0x0001-0x2295 = 31x64, 8x8              ; AMD AM29DS163T 16 Mbit top
0x0001-0x2296 = 8x8, 31x64              ; AMD AM29DS163B 16 Mbit bottom
; atmel
0x001F-0x00C6 = 15x64, 8x8              ; ATMEL AT49SV802AT 8 Mbit top
0x001F-0x00C4 = 8x8, 15x64              ; ATMEL AT49SV802A 8 Mbit bottom
0x001F-0x00D1 = 63x64, 8x8              ; ATMEL AT49SV322AT 32 Mbit top
0x001F-0x00DB = 8x8, 63x64              ; ATMEL AT49SV322A 32 Mbit bottom
0x001F-0x01D1 = 63x64, 8x8              ; ATMEL AT49SV322DT 32 Mbit top
0x001F-0x01DB = 8x8, 63x64              ; ATMEL AT49SV322D 32 Mbit bottom
; fujitsu / spansion
0x0004-0x2270 = 7x64, 1x32, 2x8, 1x16   ; Fujitsu MBM29SL400T 4 Mbit top
0x0004-0x22F1 = 1x16, 2x8, 1x32, 7x64   ; Fujitsu MBM29SL400B 4 Mbit bottom
0x0004-0x22EA = 15x64, 1x32, 2x8, 1x16  ; Fujitsu MBM29SL800T 8 Mbit top
0x0004-0x226B = 1x16, 2x8, 1x32, 15x64  ; Fujitsu MBM29SL800B 8 Mbit bottom
0x0004-0x22E4 = 31x64, 8x8              ; Fujitsu MBM29SL160T 16 Mbit top
0x0004-0x22E7 = 8x8, 31x64              ; Fujitsu MBM29SL160B 16 Mbit bottom
0x0004-0x2295 = 31x64, 8x8              ; Fujitsu MBM29DS163T 16 Mbit top
0x0004-0x2296 = 8x8, 31x64              ; Fujitsu MBM29DS163B 16 Mbit bottom
; sst
0x00BF-0x272F = 128x4                   ; SST SST39WF400A 4 Mbit
0x00BF-0x272E = 128x4                   ; SST SST39WF400B 4 Mbit
0x00BF-0x273F = 256x4                   ; SST SST39WF800A 8 Mbit
0x00BF-0x273E = 256x4                   ; SST SST39WF800B 8 Mbit
0x00BF-0x274B = 512x4                   ; SST SST39WF1601 16 Mbit bottom
0x00BF-0x274A = 512x4                   ; SST SST39WF1602 16 Mbit top
; eon (0x011C = 0x001C on bank two)
0x011C-0x2270 = 7x64, 1x32, 2x8, 1x16   ; EON EN29SL400T 4 Mbit top
0x011C-0x22F1 = 1x16, 2x8, 1x32, 7x64   ; EON EN29SL400B 4 Mbit bottom
0x011C-0x22EA = 15x64, 1x32, 2x8, 1x16  ; EON EN29SL800T 8 Mbit top
0x011C-0x226B = 1x16, 2x8, 1x32, 15x64  ; EON EN29SL800B 8 Mbit bottom
0x011C-0x22E4 = 31x64, 8x8              ; EON EN29SL160T 16 Mbit top
0x011C-0x22E7 = 8x8, 31x64              ; EON EN29SL160B 16 Mbit bottom
0x011C-0x273F = 256x4                   ; EON EN39SL800 8 Mbit
0x011C-0x274B = 512x4                   ; EON EN39SL160 16 Mbit bottom
0x011C-0x274A = 512x4                   ; EON EN39SL160 16 Mbit top
; ---- parallel flash, 3V ----
; alliance
0x0052-0x22DA = 15x64, 1x32, 2x8, 1x16  ; ALLIANCE AS29LV800T 8 Mbit top
0x0052-0x225B = 1x16, 2x8, 1x32, 15x64  ; ALLIANCE AS29LV800B 8 Mbit bottom
; amd / spansion
0x0001-0x22B9 = 7x64, 1x32, 2x8, 1x16   ; AMD AM29LV400BT 4 Mbit top
0x0001-0x22BA = 1x16, 2x8, 1x32, 7x64   ; AMD AM29LV400BB 4 Mbit bottom
0x0001-0x22DA = 15x64, 1x32, 2x8, 1x16  ; AMD AM29LV800BT 8 Mbit top
0x0001-0x225B = 1x16, 2x8, 1x32, 15x64  ; AMD AM29LV800BB 8 Mbit bottom
0x0001-0x22C4 = 31x64, 1x32, 2x8, 1x16  ; AMD AM29LV160B 16 Mbit top
0x0001-0x2249 = 1x16, 2x8, 1x32, 31x64  ; AMD AM29LV160B 16 Mbit bottom
0x0001-0x222B = 8x8, 31x64              ; AMD AM29DL163B 16 Mbit bottom
; amic
0x0037-0xB334 = 7x64, 1x32, 2x8, 1x16   ; Amic 29L400ATV 4 Mbit top
0x0037-0xB3B5 = 1x16, 2x8, 1x32, 7x64   ; Amic 29L400AUV 4 Mbit bottom
0x0037-0xB31A = 15x64, 1x32, 2x8, 1x16  ; Amic 29L800ATV 8 Mbit top
0x0037-0xB39B = 1x16, 2x8, 1x32, 15x64  ; Amic 29L800AUV 8 Mbit bottom
0x0037-0x22C4 = 31x64, 1x32, 2x8, 1x16  ; Amic 29L160ATV 16 Mbit top
0x0037-0x2249 = 1x16, 2x8, 1x32, 31x64  ; Amic 29L160AUV 16 Mbit bottom
; atmel
0x001F-0x01C3 = 15x64, 8x8              ; ATMEL AT49LV802AT 8 Mbit top
0x001F-0x01C1 = 8x8, 15x64              ; ATMEL AT49LV802A 8 Mbit bottom
0x001F-0x01C9 = 63x64, 8x8              ; ATMEL AT49LV322D 32 Mbit top
0x001F-0x01C8 = 8x8, 63x64              ; ATMEL AT49LV322DT 32 Mbit bottom
; eon
0x011C-0x22B9 = 7x64, 1x32, 2x8, 1x16   ; EON EN29LV400AT 4 Mbit top
0x011C-0x22BA = 1x16, 2x8, 1x32, 7x64   ; EON EN29LV400AB 4 Mbit bottom
0x011C-0x22DA = 15x64, 1x32, 2x8, 1x16  ; EON EN29LV800BT 8 Mbit top
0x011C-0x225B = 1x16, 2x8, 1x32, 15x64  ; EON EN29LV800BB 8 Mbit bottom
0x011C-0x22C4 = 31x64, 1x32, 2x8, 1x16  ; EON EN29LV160AT 16 Mbit top
0x011C-0x2249 = 1x16, 2x8, 1x32, 31x64  ; EON EN29LV160AB 16 Mbit bottom
; fujitsu / spansion
0x0004-0x22B9 = 7x64, 1x32, 2x8, 1x16   ; Fujitsu MBM29LV400T 4 Mbit top
0x0004-0x22BA = 1x16, 2x8, 1x32, 7x64   ; Fujitsu MBM29LV400B 4 Mbit bottom
0x0004-0x22DA = 15x64, 1x32, 2x8, 1x16  ; Fujitsu MBM29LV800T 8 Mbit top
0x0004-0x225B = 1x16, 2x8, 1x32, 15x64  ; Fujitsu MBM29LV800B 8 Mbit bottom
0x0004-0x2249 = 1x16, 2x8, 1x32, 31x64  ; Fujitsu MBM29LV160B 16 Mbit bottom
0x0004-0x222B = 8x8, 31x64              ; Fujitsu MBM29DL163B
; mxic
0x00C2-0x22B9 = 7x64, 1x32, 2x8, 1x16   ; MXIC MX29LV400T 4 Mbit top
0x00C2-0x22BA = 1x16, 2x8, 1x32, 7x64   ; MXIC MX29LV400B 4 Mbit bottom
0x00C2-0x22DA = 15x64, 1x32, 2x8, 1x16  ; MXIC MX29LV800T 8 Mbit top
0x00C2-0x225B = 1x16, 2x8, 1x32, 15x64  ; MXIC MX29LV800B 8 Mbit bottom
0x00C2-0x22C4 = 31x64, 1x32, 2x8, 1x16  ; MXIC MX29LV160T 16 Mbit top
0x00C2-0x2249 = 1x16, 2x8, 1x32, 31x64  ; MXIC MX29LV160B 16 Mbit bottom
; st
0x0020-0x00EE = 7x64, 1x32, 2x8, 1x16   ; ST M29W400AT 4 Mbit top
0x0020-0x00EF = 1x16, 2x8, 1x32, 7x64   ; ST M29W400AB 4 Mbit bottom
0x0020-0x22D7 = 15x64, 1x32, 2x8, 1x16  ; ST M29W800DT 8 Mbit top
0x0020-0x225B = 1x16, 2x8, 1x32, 15x64  ; ST M29W800DB 8 Mbit bottom
0x0020-0x2249 = 1x16, 2x8, 1x32, 31x64  ; ST M29W160B 16 Mbit bottom
0x0020-0x2256 = 63x64, 8x8              ; ST M29W320ET 32 Mbit top
0x0020-0x2257 = 8x8, 63x64              ; ST M29W320EB 32 Mbit bottom
; sst
0x00BF-0x2780 = 128x4                   ; SST SST39VF400 4 Mbit
0x00BF-0x2781 = 256x4                   ; SST SST39VF800 8 Mbit
";

/// One table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashEntry {
    /// JEDEC manufacturer id.
    pub manufacturer: u16,
    /// Device id.
    pub device: u16,
    /// Sector layout.
    pub layout: FlashLayout,
}

/// Flash organization table keyed by manufacturer and device id.
#[derive(Debug, Clone, Default)]
pub struct FlashTable {
    entries: Vec<FlashEntry>,
}

impl FlashTable {
    /// The compiled-in table.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_TABLE)
    }

    /// Read a table from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::FlashLayout(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!("Using flash table {}", path.display());
        Self::parse(&text)
    }

    /// Parse table text.
    ///
    /// Lines whose key is not a `0xMMMM-0xDDDD` pair (section headers,
    /// placeholder rows) are skipped; malformed layouts are errors.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (lineno, raw) in text
            .lines()
            .enumerate()
        {
            let line = strip_comment(raw).trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some((manufacturer, device)) = parse_key(key.trim()) else {
                continue;
            };

            let layout = parse_layout(value).map_err(|e| {
                Error::FlashLayout(format!("line {}: {e}", lineno + 1))
            })?;
            entries.push(FlashEntry {
                manufacturer,
                device,
                layout,
            });
        }

        Ok(Self { entries })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.entries
            .len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.entries
            .is_empty()
    }

    /// Layout for a device. The first matching row wins.
    pub fn lookup(&self, manufacturer: u16, device: u16) -> Option<&FlashLayout> {
        self.entries
            .iter()
            .find(|e| e.manufacturer == manufacturer && e.device == device)
            .map(|e| &e.layout)
    }
}

fn strip_comment(line: &str) -> &str {
    let end = [";", "#", "//"]
        .iter()
        .filter_map(|marker| line.find(marker))
        .min()
        .unwrap_or(line.len());
    &line[..end]
}

fn parse_key(key: &str) -> Option<(u16, u16)> {
    let (man, dev) = key.split_once('-')?;
    Some((parse_hex16(man.trim())?, parse_hex16(dev.trim())?))
}

fn parse_hex16(s: &str) -> Option<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))?;
    u16::from_str_radix(digits, 16).ok()
}

/// Parse `7x64, 1x32` (sector count x KiB).
pub fn parse_layout(value: &str) -> std::result::Result<FlashLayout, String> {
    let mut blocks = Vec::new();

    for item in value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
    {
        let (count, kib) = item
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected <count>x<KiB>, got '{item}'"))?;
        let count: u32 = count
            .parse()
            .map_err(|_| format!("bad sector count in '{item}'"))?;
        let kib: u32 = kib
            .parse()
            .map_err(|_| format!("bad sector size in '{item}'"))?;
        if count == 0 || kib == 0 {
            return Err(format!("empty block '{item}'"));
        }
        let size = kib
            .checked_mul(1024)
            .ok_or_else(|| format!("sector size too large in '{item}'"))?;
        blocks.push(BlockDef { count, size });
    }

    if blocks.is_empty() {
        return Err("no blocks".to_string());
    }
    Ok(FlashLayout::new(blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_parses() {
        let table = FlashTable::builtin().unwrap();
        assert!(table.len() > 80);

        let layout = table
            .lookup(0x0001, 0x2270)
            .unwrap();
        assert_eq!(layout.sector_count(), 11);
        assert_eq!(layout.total_size(), 512 * 1024);

        let sst = table
            .lookup(0x00BF, 0x2781)
            .unwrap();
        assert_eq!(sst, &FlashLayout::uniform(256, 4096));
        assert!(table.lookup(0xFFFF, 0xFFFF).is_none());
    }

    #[test]
    fn test_every_builtin_layout_is_power_of_two_mbit() {
        let table = FlashTable::builtin().unwrap();
        for entry in &table.entries {
            let bits = entry.layout.total_size() * 8;
            assert!(
                bits.is_power_of_two(),
                "{:04X}-{:04X} has odd size {}",
                entry.manufacturer,
                entry.device,
                entry.layout.total_size()
            );
        }
    }

    #[test]
    fn test_parse_custom_table() {
        let text = "[FLASH]\n# custom\n0x00C2-0x1234 = 2x32 , 4x16 // trailing\nUNKNOWN = 256x2\n";
        let table = FlashTable::parse(text).unwrap();
        assert_eq!(table.len(), 1);
        let layout = table
            .lookup(0x00C2, 0x1234)
            .unwrap();
        assert_eq!(
            layout.blocks(),
            &[
                BlockDef { count: 2, size: 32 * 1024 },
                BlockDef { count: 4, size: 16 * 1024 },
            ]
        );
    }

    #[test]
    fn test_parse_rejects_bad_layout() {
        let err = FlashTable::parse("0x0001-0x0002 = 3y4\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert!(FlashTable::parse("0x0001-0x0002 = 0x4\n").is_err());
        assert!(FlashTable::parse("0x0001-0x0002 = \n").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.txt");
        fs::write(&path, "0x0020-0x2256 = 63x64, 8x8\n").unwrap();
        let table = FlashTable::from_file(&path).unwrap();
        assert_eq!(
            table
                .lookup(0x0020, 0x2256)
                .map(FlashLayout::total_size),
            Some(4 * 1024 * 1024)
        );
        assert!(FlashTable::from_file(dir.path().join("missing.txt")).is_err());
    }
}
