//! Structure offset database for different kernel versions
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub extra: String, // Additional version info like "-generic"
}

impl KernelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        KernelVersion {
            major,
            minor,
            patch,
            extra: String::new(),
        }
    }

    /// Parse a release string like "4.1.0-91-generic" or "3.13.0".
    pub fn parse(version_str: &str) -> Option<Self> {
        let version_clean = version_str.split_whitespace().next()?;
        let parts: Vec<&str> = version_clean.splitn(3, '.').collect();

        if parts.len() < 2 {
            return None;
        }

        let major = parts[0].parse::<u32>().ok()?;
        let minor_digits: String = parts[1].chars().take_while(|c| c.is_ascii_digit()).collect();
        let minor = minor_digits.parse::<u32>().ok()?;

        let (patch, extra) = if parts.len() == 3 {
            let digits: String = parts[2].chars().take_while(|c| c.is_ascii_digit()).collect();
            let rest = &parts[2][digits.len()..];
            (digits.parse::<u32>().unwrap_or(0), rest.to_string())
        } else {
            (0, parts[1][minor_digits.len()..].to_string())
        };

        Some(KernelVersion {
            major,
            minor,
            patch,
            extra,
        })
    }

    fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

// The extra suffix never affects which kernel rules apply.
impl PartialEq for KernelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for KernelVersion {}

impl PartialOrd for KernelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}{}",
            self.major, self.minor, self.patch, self.extra
        )
    }
}

/// Structure to hold offset information for different kernel versions
pub struct StructureOffsets {
    kernel_version: Option<KernelVersion>,
    offsets: HashMap<String, HashMap<String, usize>>,
    sizes: HashMap<String, usize>,
}

impl StructureOffsets {
    /// Create a new structure offsets database
    pub fn new() -> Self {
        Self {
            kernel_version: None,
            offsets: HashMap::new(),
            sizes: HashMap::new(),
        }
    }

    /// Get offsets for a specific kernel version
    pub fn for_kernel(version: &KernelVersion) -> Self {
        let mut db = Self::new();
        db.kernel_version = Some(version.clone());
        db.load_offsets_for_version(version);
        db
    }

    /// Offsets used when the kernel version is unknown
    pub fn defaults() -> Self {
        let mut db = Self::new();
        db.load_offsets_4_x();
        db.load_common();
        db
    }

    fn load_offsets_for_version(&mut self, version: &KernelVersion) {
        match version.major {
            0..=3 => self.load_offsets_3_x(version),
            _ => self.load_offsets_4_x(),
        }
        self.load_common();
    }

    fn insert_fields(&mut self, struct_name: &str, fields: &[(&str, usize)]) {
        let entry = self.offsets.entry(struct_name.to_string()).or_default();
        for (name, offset) in fields {
            entry.insert(name.to_string(), *offset);
        }
    }

    /// arm64 defconfig layouts for 3.x kernels
    fn load_offsets_3_x(&mut self, version: &KernelVersion) {
        self.insert_fields(
            "task_struct",
            &[
                ("stack", 0x8),
                ("on_cpu", 0x2c),
                ("tasks", 0x258),
                ("mm", 0x290),
                ("pid", 0x2e0),
                ("comm", 0x4a8),
                ("thread", 0x5c0),
            ],
        );
        // vmacache_seqnum pushed pgd back by a word in 3.15
        let pgd = if *version >= KernelVersion::new(3, 15, 0) {
            0x40
        } else {
            0x38
        };
        self.insert_fields("mm_struct", &[("pgd", pgd)]);
    }

    /// arm64 defconfig layouts for 4.x kernels
    fn load_offsets_4_x(&mut self) {
        self.insert_fields(
            "task_struct",
            &[
                ("stack", 0x8),
                ("on_cpu", 0x2c),
                ("tasks", 0x2e8),
                ("mm", 0x318),
                ("pid", 0x3b8),
                ("comm", 0x5a8),
                ("thread", 0x6e0),
            ],
        );
        self.insert_fields("mm_struct", &[("pgd", 0x40)]);
    }

    /// Layouts fixed by the arm64 ABI or stable across versions
    fn load_common(&mut self) {
        self.insert_fields("list_head", &[("next", 0x0), ("prev", 0x8)]);
        self.insert_fields("thread_struct", &[("cpu_context", 0x0)]);
        // x19..x28, then fp, sp, pc
        self.insert_fields("cpu_context", &[("fp", 0x50), ("sp", 0x58), ("pc", 0x60)]);
        self.insert_fields("stackframe", &[("fp", 0x0), ("sp", 0x8), ("pc", 0x10)]);
        self.insert_fields("thread_info", &[("cpu", 0x1c)]);
        self.insert_fields("elf_prstatus", &[("pr_pid", 0x20), ("pr_reg", 0x70)]);

        self.sizes.insert("pt_regs".to_string(), 288);
        self.sizes.insert("page".to_string(), 64);
        self.sizes.insert("elf_prstatus".to_string(), 392);
        self.sizes.insert("note_buf_t".to_string(), 424);
    }

    /// Get the offset of a field within a structure
    pub fn get_offset(&self, struct_name: &str, field_name: &str) -> Option<usize> {
        self.offsets.get(struct_name)?.get(field_name).copied()
    }

    /// Get the size of a structure
    pub fn get_size(&self, struct_name: &str) -> Option<usize> {
        self.sizes.get(struct_name).copied()
    }

    /// Get the kernel version this database is for
    pub fn get_kernel_version(&self) -> Option<&KernelVersion> {
        self.kernel_version.as_ref()
    }
}
