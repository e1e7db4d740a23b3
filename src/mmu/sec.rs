//! SEC (ARM-class) virtual memory: a CP15-style control/TTBR/domain register
//! file gating a section/coarse-page-table walk.

use crate::cpu::Exception;
use crate::error::HvError;
use crate::memory::PhysMemHandle;
use crate::mmu::{Protection, Tlb, Translation, Translator};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DomainAccess {
    NoAccess,
    Client,
    Manager,
}

fn domain_access(bits: u32) -> DomainAccess {
    match bits & 0x3 {
        0 => DomainAccess::NoAccess,
        3 => DomainAccess::Manager,
        _ => DomainAccess::Client,
    }
}

fn protection_from_ap(supervisor: bool, ap: u32) -> Protection {
    match ap {
        0 => Protection::NoAccess,
        1 => {
            if supervisor {
                Protection::ReadWrite
            } else {
                Protection::NoAccess
            }
        }
        2 => {
            if supervisor {
                Protection::ReadWrite
            } else {
                Protection::ReadOnly
            }
        }
        _ => Protection::ReadWrite,
    }
}

/// Result of consulting [`SecMmu::fault_outcome`] for a translation or
/// protection fault.
#[derive(Debug)]
pub enum FaultOutcome {
    Fatal(HvError),
    Recoverable(Exception),
}

pub struct SecMmu {
    phys: PhysMemHandle,
    enabled: bool,
    ttbr: u32,
    domain_access_control: u32,
    supervisor: bool,
    /// Whether a translation/protection fault terminates the host process
    /// (`true`, the default) or should be delivered to the guest as a
    /// prefetch/data abort via [`fault_outcome`](Self::fault_outcome). Set
    /// from `--abort` (`Config::aborts_are_recoverable`) at construction.
    fatal_on_fault: bool,
    fault_status: u32,
    fault_address: u32,
    tlb: Tlb<64>,
}

impl SecMmu {
    pub fn new(phys: PhysMemHandle, fatal_on_fault: bool) -> Self {
        Self {
            phys,
            enabled: false,
            ttbr: 0,
            domain_access_control: 0,
            supervisor: true,
            fatal_on_fault,
            fault_status: 0,
            fault_address: 0,
            tlb: Tlb::new(),
        }
    }

    pub fn set_supervisor(&mut self, supervisor: bool) {
        self.supervisor = supervisor;
    }

    pub fn control(&self) -> u32 {
        self.enabled as u32
    }
    pub fn set_control(&mut self, value: u32) {
        self.enabled = value & 1 != 0;
        self.tlb.flush();
    }

    pub fn ttbr(&self) -> u32 {
        self.ttbr
    }
    pub fn set_ttbr(&mut self, value: u32) {
        self.ttbr = value;
        self.tlb.flush();
    }

    pub fn domain_access_control(&self) -> u32 {
        self.domain_access_control
    }
    pub fn set_domain_access_control(&mut self, value: u32) {
        self.domain_access_control = value;
        self.tlb.flush();
    }

    pub fn fault_status(&self) -> u32 {
        self.fault_status
    }
    pub fn fault_address(&self) -> u32 {
        self.fault_address
    }

    pub fn invalidate_tlb(&mut self) {
        self.tlb.flush();
    }

    pub fn fatal_on_fault(&self) -> bool {
        self.fatal_on_fault
    }

    /// What an interpreter should do with a fault `translate_mut`/the
    /// `Translator` methods returned, per `fatal_on_fault`: propagate it
    /// unchanged (the host-terminating default), or vector a prefetch/data
    /// abort into the guest instead. `fetch` distinguishes an instruction
    /// fetch from a data access, since the two vector to different
    /// exceptions even for the same faulting address.
    pub fn fault_outcome(&self, err: HvError, fetch: bool) -> FaultOutcome {
        if self.fatal_on_fault {
            return FaultOutcome::Fatal(err);
        }
        match err {
            HvError::TranslationFault { addr, write } | HvError::ProtectionFault { addr, write } => {
                if fetch {
                    FaultOutcome::Recoverable(Exception::InstructionStorage { addr })
                } else {
                    FaultOutcome::Recoverable(Exception::DataStorage { addr, write })
                }
            }
            other => FaultOutcome::Fatal(other),
        }
    }

    fn domain_of(&self, domain: u32) -> DomainAccess {
        let shift = domain * 2;
        domain_access(self.domain_access_control >> shift)
    }

    fn read_phys_u32(&self, addr: u32) -> Result<u32, HvError> {
        let bytes = self.phys.borrow().read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn walk(&self, ea: u32, write: bool) -> Result<(u32, Protection), HvError> {
        let first_level_addr = (self.ttbr & 0xFFFF_C000) | ((ea >> 20) << 2);
        let first = self.read_phys_u32(first_level_addr)?;

        match first & 0x3 {
            0x2 => {
                // Section descriptor: 1 MiB.
                let domain = (first >> 5) & 0xF;
                let ap = (first >> 10) & 0x3;
                let base = first & 0xFFF0_0000;
                let protection = self.check_domain(domain, ap, ea, write)?;
                Ok((base | (ea & 0x000F_FFFF), protection))
            }
            0x1 => {
                // Coarse page table: 256 entries of 4 KiB pages.
                let domain = (first >> 5) & 0xF;
                let base = first & 0xFFFF_FC00;
                let second_level_addr = base | (((ea >> 12) & 0xFF) << 2);
                let second = self.read_phys_u32(second_level_addr)?;
                match second & 0x3 {
                    0x2 => {
                        let subpage = (ea >> 10) & 0x3;
                        let ap = (second >> (4 + 2 * subpage)) & 0x3;
                        let base = second & 0xFFFF_F000;
                        let protection = self.check_domain(domain, ap, ea, write)?;
                        Ok((base | (ea & 0xFFF), protection))
                    }
                    _ => Err(HvError::TranslationFault { addr: ea, write }),
                }
            }
            _ => Err(HvError::TranslationFault { addr: ea, write }),
        }
    }

    fn check_domain(&self, domain: u32, ap: u32, ea: u32, write: bool) -> Result<Protection, HvError> {
        match self.domain_of(domain) {
            DomainAccess::NoAccess => Err(HvError::TranslationFault { addr: ea, write }),
            DomainAccess::Manager => Ok(Protection::ReadWrite),
            DomainAccess::Client => Ok(protection_from_ap(self.supervisor, ap)),
        }
    }

    fn record_fault(&mut self, addr: u32, status: u32) {
        self.fault_address = addr;
        self.fault_status = status;
    }

    fn translate(&self, ea: u32, write: bool) -> Result<u32, HvError> {
        if !self.enabled {
            return Ok(ea);
        }
        let vpn = ea >> 12;
        if let Some(t) = self.tlb.lookup(vpn) {
            if !t.protection.allows(write) {
                return Err(HvError::ProtectionFault { addr: ea, write });
            }
            return Ok(t.phys_addr | (ea & 0xFFF));
        }
        let (phys, protection) = self.walk(ea, write)?;
        if !protection.allows(write) {
            return Err(HvError::ProtectionFault { addr: ea, write });
        }
        Ok(phys)
    }

    /// Mutating variant that refills the TLB; callers holding `&mut SecMmu`
    /// (the core's own load/store path) should prefer this over the
    /// `Translator` impl, which cannot cache across calls.
    pub fn translate_mut(&mut self, ea: u32, write: bool) -> Result<u32, HvError> {
        match self.translate(ea, write) {
            Ok(phys) => {
                if self.enabled {
                    let vpn = ea >> 12;
                    if self.tlb.lookup(vpn).is_none() {
                        if let Ok((phys_page, protection)) = self.walk(ea, write) {
                            self.tlb.insert(vpn, Translation { phys_addr: phys_page & !0xFFF, protection, executable: true });
                        }
                    }
                }
                Ok(phys)
            }
            Err(e) => {
                if let HvError::TranslationFault { addr, .. } | HvError::ProtectionFault { addr, .. } = e {
                    self.record_fault(addr, 0);
                }
                Err(e)
            }
        }
    }
}

impl Translator for SecMmu {
    fn translate_data_read(&self, ea: u32) -> Result<u32, HvError> {
        self.translate(ea, false)
    }
    fn translate_data_write(&self, ea: u32) -> Result<u32, HvError> {
        self.translate(ea, true)
    }
    fn translate_instruction_fetch(&self, ea: u32) -> Result<u32, HvError> {
        self.translate(ea, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn mmu() -> SecMmu {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x10_0000);
        SecMmu::new(phys, true)
    }

    #[test]
    fn translation_disabled_is_identity() {
        let mmu = mmu();
        assert_eq!(mmu.translate_data_read(0xABCD_1234).unwrap(), 0xABCD_1234);
    }

    #[test]
    fn manager_domain_bypasses_ap() {
        let mut mmu = mmu();
        // First-level descriptor at TTBR[ea>>20]: section, domain 0, AP=0 (would deny client access).
        let section_descriptor: u32 = 0x2 | (0 << 5) | (0 << 10) | 0x0010_0000;
        mmu.phys.borrow_mut().write_bytes(0, &section_descriptor.to_le_bytes()).unwrap();
        mmu.set_ttbr(0);
        mmu.set_domain_access_control(0b11); // domain 0 = manager
        mmu.set_control(1);
        assert_eq!(mmu.translate_data_read(0x0000_0010).unwrap(), 0x0010_0010);
    }

    #[test]
    fn no_access_domain_faults() {
        let mut mmu = mmu();
        let section_descriptor: u32 = 0x2 | (0 << 5) | (0x3 << 10) | 0x0010_0000;
        mmu.phys.borrow_mut().write_bytes(0, &section_descriptor.to_le_bytes()).unwrap();
        mmu.set_ttbr(0);
        mmu.set_domain_access_control(0b00); // domain 0 = no access
        mmu.set_control(1);
        assert!(matches!(mmu.translate_data_read(0x10), Err(HvError::TranslationFault { .. })));
    }

    #[test]
    fn fault_outcome_is_fatal_by_default() {
        let mmu = mmu();
        assert!(mmu.fatal_on_fault());
        let err = HvError::TranslationFault { addr: 0x10, write: false };
        assert!(matches!(mmu.fault_outcome(err, false), FaultOutcome::Fatal(_)));
    }

    #[test]
    fn fault_outcome_vectors_a_guest_abort_when_recoverable() {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x10_0000);
        let mmu = SecMmu::new(phys, false);
        let err = HvError::TranslationFault { addr: 0x10, write: true };
        assert!(matches!(
            mmu.fault_outcome(err, false),
            FaultOutcome::Recoverable(Exception::DataStorage { addr: 0x10, write: true })
        ));
        let err = HvError::ProtectionFault { addr: 0x20, write: false };
        assert!(matches!(
            mmu.fault_outcome(err, true),
            FaultOutcome::Recoverable(Exception::InstructionStorage { addr: 0x20 })
        ));
    }
}
