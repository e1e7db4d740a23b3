//! APP (PowerPC-class) virtual memory: BAT pairs, segment registers, a
//! hashed page table walk, and a small TLB.
//!
//! The BAT/PTE bit layouts below follow the documented PowerPC block- and
//! page-address-translation formats; the emulator does not need to match a
//! specific silicon revision bit-for-bit, only the invariants this crate names
//! (BAT precedence, page-table-walk result, TLB coherence on any BAT/SR/SDR1
//! write).

use crate::error::HvError;
use crate::memory::PhysMemHandle;
use crate::mmu::{Protection, Tlb, Translation, Translator};

/// Open question, resolved: this platform's real-page-number field is 15
/// bits wide regardless of page size; kept as a literal constant rather
/// than derived from the page-size constant.
pub const RPN_BITS: u32 = 15;

#[derive(Debug, Copy, Clone, Default)]
struct Bat {
    upper: u32,
    lower: u32,
}

impl Bat {
    fn valid_for(&self, supervisor: bool) -> bool {
        if supervisor {
            self.upper & 0x2 != 0
        } else {
            self.upper & 0x1 != 0
        }
    }
    fn bepi(&self) -> u32 {
        (self.upper >> 17) & 0x7FFF
    }
    fn bl(&self) -> u32 {
        (self.upper >> 2) & 0x3FF
    }
    fn brpn(&self) -> u32 {
        (self.lower >> 17) & 0x7FFF
    }
    fn pp(&self) -> u32 {
        self.lower & 0x3
    }

    fn matches(&self, ea: u32, supervisor: bool) -> bool {
        if !self.valid_for(supervisor) {
            return false;
        }
        let significant = 0x7FFF & !self.bl();
        ((ea >> 17) & significant) == (self.bepi() & significant)
    }

    fn translate(&self, ea: u32) -> (u32, Protection) {
        let offset_mask = (self.bl() << 17) | 0x1FFFF;
        let phys = (self.brpn() << 17) | (ea & offset_mask);
        let prot = match self.pp() {
            0 => Protection::NoAccess,
            1 | 3 => Protection::ReadOnly,
            2 => Protection::ReadWrite,
            _ => unreachable!(),
        };
        (phys, prot)
    }
}

#[derive(Debug, Copy, Clone, Default)]
struct SegmentRegister(u32);

impl SegmentRegister {
    fn direct_store(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
    fn ks(self) -> bool {
        self.0 & 0x4000_0000 != 0
    }
    fn kp(self) -> bool {
        self.0 & 0x2000_0000 != 0
    }
    fn no_execute(self) -> bool {
        self.0 & 0x1000_0000 != 0
    }
    fn vsid(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }
}

#[derive(Debug, Copy, Clone)]
struct Pte {
    valid: bool,
    vsid: u32,
    secondary: bool,
    api: u32,
    rpn: u32,
    pp: u32,
}

impl Pte {
    fn from_words(w0: u32, w1: u32) -> Self {
        Self {
            valid: w0 & 0x8000_0000 != 0,
            vsid: (w0 >> 7) & 0x00FF_FFFF,
            secondary: w0 & 0x40 != 0,
            api: w0 & 0x3F,
            rpn: (w1 >> 12) & ((1 << RPN_BITS) - 1),
            pp: w1 & 0x3,
        }
    }
}

pub struct AppMmu {
    phys: PhysMemHandle,
    ibat: [Bat; 8],
    dbat: [Bat; 8],
    sr: [SegmentRegister; 16],
    sdr1: u32,
    translate_instr: bool,
    translate_data: bool,
    supervisor: bool,
    itlb: Tlb<64>,
    dtlb: Tlb<64>,
}

impl AppMmu {
    pub fn new(phys: PhysMemHandle) -> Self {
        Self {
            phys,
            ibat: Default::default(),
            dbat: Default::default(),
            sr: Default::default(),
            sdr1: 0,
            translate_instr: false,
            translate_data: false,
            supervisor: true,
            itlb: Tlb::new(),
            dtlb: Tlb::new(),
        }
    }

    pub fn set_supervisor(&mut self, supervisor: bool) {
        self.supervisor = supervisor;
    }

    pub fn set_msr_translation(&mut self, instr: bool, data: bool) {
        self.translate_instr = instr;
        self.translate_data = data;
    }

    pub fn get_ibatu(&self, n: usize) -> u32 {
        self.ibat[n].upper
    }
    pub fn get_ibatl(&self, n: usize) -> u32 {
        self.ibat[n].lower
    }
    pub fn set_ibatu(&mut self, n: usize, value: u32) {
        self.ibat[n].upper = value;
        self.itlb.flush();
    }
    pub fn set_ibatl(&mut self, n: usize, value: u32) {
        self.ibat[n].lower = value;
        self.itlb.flush();
    }
    pub fn get_dbatu(&self, n: usize) -> u32 {
        self.dbat[n].upper
    }
    pub fn get_dbatl(&self, n: usize) -> u32 {
        self.dbat[n].lower
    }
    pub fn set_dbatu(&mut self, n: usize, value: u32) {
        self.dbat[n].upper = value;
        self.dtlb.flush();
    }
    pub fn set_dbatl(&mut self, n: usize, value: u32) {
        self.dbat[n].lower = value;
        self.dtlb.flush();
    }

    pub fn get_sr(&self, n: usize) -> u32 {
        self.sr[n].0
    }
    pub fn set_sr(&mut self, n: usize, value: u32) {
        self.sr[n] = SegmentRegister(value);
        self.itlb.flush();
        self.dtlb.flush();
    }

    pub fn set_sdr1(&mut self, value: u32) {
        self.sdr1 = value;
        self.itlb.flush();
        self.dtlb.flush();
    }

    /// Explicit TLB-invalidate instruction (`tlbie`).
    pub fn invalidate_tlb(&mut self) {
        self.itlb.flush();
        self.dtlb.flush();
    }

    fn walk_bats(&self, ea: u32, instr: bool) -> Option<(u32, Protection)> {
        let bats = if instr { &self.ibat } else { &self.dbat };
        bats.iter().find(|b| b.matches(ea, self.supervisor)).map(|b| b.translate(ea))
    }

    fn pteg_address(&self, hash: u32) -> u32 {
        let mask = self.sdr1 & 0x1FF;
        let base = self.sdr1 & 0xFFFF_0000;
        base.wrapping_add((hash & ((mask << 10) | 0x3FF)) << 6)
    }

    fn scan_pteg(&self, pteg_addr: u32, vsid: u32, api: u32, secondary: bool) -> Result<Option<Pte>, HvError> {
        for slot in 0..8 {
            let addr = pteg_addr + slot * 8;
            let w0 = self.read_phys_u32(addr)?;
            let w1 = self.read_phys_u32(addr + 4)?;
            let pte = Pte::from_words(w0, w1);
            if pte.valid && pte.vsid == vsid && pte.api == api && pte.secondary == secondary {
                return Ok(Some(pte));
            }
        }
        Ok(None)
    }

    fn read_phys_u32(&self, addr: u32) -> Result<u32, HvError> {
        let bytes = self.phys.borrow().read_bytes(addr, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn walk_page_table(&self, ea: u32, instr: bool, write: bool) -> Result<(u32, Protection), HvError> {
        let sr = self.sr[((ea >> 28) & 0xF) as usize];
        if sr.direct_store() {
            return Err(HvError::TranslationFault { addr: ea, write });
        }
        let vsid = sr.vsid();
        let page_index = (ea >> 12) & 0xFFFF;
        let api = (ea >> 16) & 0x3F;

        let primary_hash = vsid ^ page_index;
        let secondary_hash = (!primary_hash) & 0x000F_FFFF;

        let pte = if let Some(pte) = self.scan_pteg(self.pteg_address(primary_hash), vsid, api, false)? {
            Some(pte)
        } else {
            self.scan_pteg(self.pteg_address(secondary_hash), vsid, api, true)?
        };

        let pte = pte.ok_or(HvError::TranslationFault { addr: ea, write })?;

        if instr && sr.no_execute() {
            return Err(HvError::ProtectionFault { addr: ea, write });
        }

        let key = if self.supervisor { sr.ks() } else { sr.kp() };
        let protection = protection_from_pp(key, pte.pp);
        let phys = (pte.rpn << 12) | (ea & 0xFFF);
        Ok((phys, protection))
    }

    fn translate(&mut self, ea: u32, instr: bool, write: bool) -> Result<(u32, Protection, bool), HvError> {
        let enabled = if instr { self.translate_instr } else { self.translate_data };
        if !enabled {
            return Ok((ea, Protection::ReadWrite, true));
        }
        if let Some((phys, prot)) = self.walk_bats(ea, instr) {
            return Ok((phys, prot, true));
        }
        let vpn = ea >> 12;
        let tlb = if instr { &self.itlb } else { &self.dtlb };
        if let Some(t) = tlb.lookup(vpn) {
            return Ok((t.phys_addr | (ea & 0xFFF), t.protection, t.executable));
        }
        let (phys_page, protection) = self.walk_page_table(ea, instr, write)?;
        let translation = Translation { phys_addr: phys_page & !0xFFF, protection, executable: !instr || true };
        let tlb = if instr { &mut self.itlb } else { &mut self.dtlb };
        tlb.insert(vpn, translation);
        Ok((phys_page, protection, true))
    }
}

fn protection_from_pp(key: bool, pp: u32) -> Protection {
    // PowerPC protection table: Ks/Kp key combined with PTE.PP.
    match (key, pp) {
        (false, _) => Protection::ReadWrite,
        (true, 0) => Protection::NoAccess,
        (true, 1) | (true, 2) => Protection::ReadWrite,
        (true, 3) => Protection::ReadOnly,
        _ => Protection::NoAccess,
    }
}

impl Translator for AppMmu {
    fn translate_data_read(&self, ea: u32) -> Result<u32, HvError> {
        self.translate_checked(ea, false, false)
    }
    fn translate_data_write(&self, ea: u32) -> Result<u32, HvError> {
        self.translate_checked(ea, false, true)
    }
    fn translate_instruction_fetch(&self, ea: u32) -> Result<u32, HvError> {
        self.translate_checked(ea, true, false)
    }
}

impl AppMmu {
    /// `Translator` takes `&self`; the BAT/page-table walk and TLB refill
    /// only mutate the TLB cache, which is safe to do from a shared
    /// reference in single-threaded interleave, so this goes through an
    /// internal helper that takes `&self` and recomputes on every miss
    /// (callers needing a populated cache use [`Self::translate_mut`]).
    fn translate_checked(&self, ea: u32, instr: bool, write: bool) -> Result<u32, HvError> {
        let enabled = if instr { self.translate_instr } else { self.translate_data };
        if !enabled {
            return Ok(ea);
        }
        if let Some((phys, prot)) = self.walk_bats(ea, instr) {
            if !prot.allows(write) {
                return Err(HvError::ProtectionFault { addr: ea, write });
            }
            return Ok(phys);
        }
        let vpn = ea >> 12;
        let tlb = if instr { &self.itlb } else { &self.dtlb };
        if let Some(t) = tlb.lookup(vpn) {
            if !t.protection.allows(write) {
                return Err(HvError::ProtectionFault { addr: ea, write });
            }
            return Ok(t.phys_addr | (ea & 0xFFF));
        }
        let (phys_page, protection) = self.walk_page_table(ea, instr, write)?;
        if !protection.allows(write) {
            return Err(HvError::ProtectionFault { addr: ea, write });
        }
        Ok(phys_page)
    }

    /// Mutating variant that also refills the TLB on a page-table-walk hit.
    pub fn translate_mut(&mut self, ea: u32, instr: bool, write: bool) -> Result<u32, HvError> {
        let (phys, _, _) = self.translate(ea, instr, write)?;
        Ok(phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn mmu() -> AppMmu {
        let phys = Rc::new(RefCell::new(crate::memory::PhysicalMemory::new()));
        phys.borrow_mut().add_range(0, 0x100_0000);
        AppMmu::new(phys)
    }

    #[test]
    fn translation_disabled_is_identity() {
        let mmu = mmu();
        assert_eq!(mmu.translate_data_read(0x1234_5678).unwrap(), 0x1234_5678);
    }

    #[test]
    fn bat_precedence_over_page_table() {
        let mut mmu = mmu();
        mmu.set_msr_translation(false, true);
        // DBAT0: valid for supervisor, BEPI=0, BL=0 (128KiB block), RW, BRPN=0x10
        mmu.set_dbatu(0, 0b10); // Vs=1
        mmu.set_dbatl(0, (0x10 << 17) | 0b10); // BRPN=0x10, PP=RW
        let phys = mmu.translate_data_read(0x0000_1000).unwrap();
        assert_eq!(phys, (0x10 << 17) | 0x1000);
    }

    #[test]
    fn tlb_flushes_on_sdr1_write() {
        let mut mmu = mmu();
        mmu.set_msr_translation(false, true);
        mmu.set_sdr1(0x1230_0003);
        assert!(mmu.dtlb.lookup(0).is_none());
    }
}
