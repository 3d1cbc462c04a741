//! Target machine description: the CPU interface the stub debugs through
//! and the register set advertised to GDB.

use std::fmt::Write;

/// Access to the emulated processor, implemented by the emulator.
///
/// The stub reads registers through the individual accessors and reaches
/// the 64 KiB bus through `read_mem`/`write_mem`. All calls happen while
/// the emulator is parked on the halt condition, so implementations do
/// not need their own locking.
pub trait Cpu: Send {
    fn a(&self) -> u8;
    fn b(&self) -> u8;
    fn c(&self) -> u8;
    fn d(&self) -> u8;
    fn e(&self) -> u8;
    fn h(&self) -> u8;
    fn l(&self) -> u8;
    fn sp(&self) -> u16;
    fn pc(&self) -> u16;

    fn read_mem(&self, addr: u16) -> u8;
    fn write_mem(&mut self, addr: u16, value: u8);
}

/// How a register is typed in the target description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Integer,
    DataPtr,
    CodePtr,
}

/// One entry of the advertised register set.
pub struct RegisterLayout {
    pub name: &'static str,
    pub kind: RegisterKind,
    pub bits: usize,
    pub read: fn(&dyn Cpu) -> u64,
}

impl RegisterLayout {
    /// The XML `type` attribute for this register.
    pub fn type_name(&self) -> String {
        match self.kind {
            RegisterKind::Integer => format!("uint{}", self.bits),
            RegisterKind::DataPtr => "data_ptr".to_owned(),
            RegisterKind::CodePtr => "code_ptr".to_owned(),
        }
    }
}

/// The register set in advertised order. The table index is the `regnum`
/// GDB uses, and the `g` reply concatenates the entries in this order, so
/// it must not be reordered independently of the architecture string.
pub static REGISTERS: [RegisterLayout; 9] = [
    RegisterLayout {
        name: "a",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.a()),
    },
    RegisterLayout {
        name: "b",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.b()),
    },
    RegisterLayout {
        name: "c",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.c()),
    },
    RegisterLayout {
        name: "d",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.d()),
    },
    RegisterLayout {
        name: "e",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.e()),
    },
    RegisterLayout {
        name: "sp",
        kind: RegisterKind::DataPtr,
        bits: 16,
        read: |cpu| u64::from(cpu.sp()),
    },
    RegisterLayout {
        name: "pc",
        kind: RegisterKind::CodePtr,
        bits: 16,
        read: |cpu| u64::from(cpu.pc()),
    },
    RegisterLayout {
        name: "h",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.h()),
    },
    RegisterLayout {
        name: "l",
        kind: RegisterKind::Integer,
        bits: 8,
        read: |cpu| u64::from(cpu.l()),
    },
];

const XML_DECL: &str = "<?xml version=\"1.0\"?><!DOCTYPE target SYSTEM \"gdb-target.dtd\">";

/// Builds the target description document for `annex`, or `None` for
/// annexes this target doesn't provide.
pub fn description_document(annex: &str) -> Option<String> {
    match annex {
        "target.xml" => {
            let mut doc = String::from(XML_DECL);
            doc.push_str(
                "<target><architecture>z80</architecture>\
                 <xi:include href=\"gb-core.xml\"/></target>",
            );
            Some(doc)
        }
        "gb-core.xml" => {
            let mut doc = String::from(XML_DECL);
            doc.push_str("<feature name=\"org.gnu.gdb.z80.core\">");
            for (regnum, layout) in REGISTERS.iter().enumerate() {
                write!(
                    doc,
                    "<reg name=\"{}\" bitsize=\"{}\" type=\"{}\" regnum=\"{}\" group=\"general\"/>\n",
                    layout.name,
                    layout.bits,
                    layout.type_name(),
                    regnum
                )
                .unwrap();
            }
            doc.push_str("</feature>");
            Some(doc)
        }
        _ => None,
    }
}
