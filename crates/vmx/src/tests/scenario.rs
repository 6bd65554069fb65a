//! End to end construction of a VMCS, from allocation to a validated host state.

use mmu::PhysRange;
use utils::{HostPhysAddr, PAGE_SIZE};

use super::*;
use crate::bitmaps::{ExitControls, PrimaryControls};
use crate::fields::traits::*;
use crate::fields::{Ctrl32, Ctrl64, GuestState64, HostState64, HostStateNat};
use crate::{VcpuConfig, VcpuId, Vmcs, VmcsState};

#[test]
fn main_scenario() {
    // Frames from 0x1000, host stack from 0x10000.
    let memory = TestMemory::new(0x20000);
    let allocator = memory.split_allocator(0x10000);
    let config = VcpuConfig::new(EXIT_HANDLER);
    let mut core = core(0, EmulatedVmx::new());

    let mut vmcs = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    assert_eq!(vmcs.vmcs_ptr(), HostPhysAddr::new(0x1000));
    assert_eq!(
        vmcs.host_stack().range().start,
        HostPhysAddr::new(0x10000)
    );
    assert_eq!(vmcs.host_stack().size(), 8 * PAGE_SIZE);
    assert_eq!(vmcs.state(), VmcsState::Uninitialized);
    assert!(core.vmx().ops.is_empty());

    vmcs.pre_initialize_vmcs(&mut core).unwrap();
    assert_eq!(vmcs.state(), VmcsState::Current);
    assert_eq!(vmcs.core(), Some(0));
    assert_eq!(core.current_vmcs(), Some(HostPhysAddr::new(0x1000)));
    assert_eq!(core.vmx().ops[..2], [Op::Clear(0x1000), Op::Load(0x1000)]);

    vmcs.initialize_vmcs(&mut core, &host_state(), &config)
        .unwrap();
    assert!(vmcs.is_ready());

    let active = core.active(&vmcs).unwrap();
    assert_eq!(
        HostStateNat::Rip.vmread(&active),
        Ok(EXIT_HANDLER.as_usize())
    );
    assert_eq!(GuestState64::VmcsLinkPtr.vmread(&active), Ok(u64::MAX));
    assert_eq!(Ctrl64::IoBitmapA.vmread(&active), Ok(0x2000));
    assert_eq!(Ctrl64::IoBitmapB.vmread(&active), Ok(0x3000));
    assert_eq!(Ctrl64::MsrBitmaps.vmread(&active), Ok(0x4000));
    assert_eq!(Ctrl32::Cr3TargetCount.vmread(&active), Ok(0));
    assert_eq!(HostState64::Ia32Efer.vmread(&active), Ok(0xd01));
}

#[test]
fn host_stack_pointer() {
    let memory = TestMemory::new(0x20000);
    let allocator = memory.range_allocator();
    let config = VcpuConfig::new(EXIT_HANDLER).with_host_stack_pages(2);
    let mut core = core(0, EmulatedVmx::new());

    let mut vmcs = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    vmcs.pre_initialize_vmcs(&mut core).unwrap();
    vmcs.initialize_vmcs(&mut core, &host_state(), &config)
        .unwrap();

    let stack = vmcs.host_stack();
    let active = core.active(&vmcs).unwrap();
    let rsp = HostStateNat::Rsp.vmread(&active).unwrap();
    assert_eq!(rsp, stack.top().as_usize() - 16);
    assert_eq!(rsp % 16, 0);
    assert!(stack.contains(HostVirtAddr::new(rsp)));
    assert_eq!(stack.size(), 2 * PAGE_SIZE);
}

#[test]
fn split_64_bits_writes() {
    let memory = TestMemory::new(0x20000);
    let allocator = memory.range_allocator();
    let config = VcpuConfig::new(EXIT_HANDLER);
    let mut core = core(0, EmulatedVmx::new());

    let mut vmcs = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    vmcs.pre_initialize_vmcs(&mut core).unwrap();
    {
        let mut active = core.active(&vmcs).unwrap();
        Ctrl64::TscOffset
            .vmwrite(&mut active, 0x1234_5678_9abc_def0)
            .unwrap();
        assert_eq!(
            Ctrl64::TscOffset.vmread(&active),
            Ok(0x1234_5678_9abc_def0)
        );
    }

    // The full encoding goes first with the low half, then the high encoding.
    let raw = Ctrl64::TscOffset as u32;
    let ops = &core.vmx().ops;
    assert_eq!(
        ops[ops.len() - 2..],
        [Op::Write(raw, 0x9abc_def0), Op::Write(raw | 1, 0x1234_5678)]
    );
}

#[test]
fn region_contents() {
    let memory = TestMemory::new(0x40000);
    let allocator = memory.range_allocator();
    let config = VcpuConfig::new(EXIT_HANDLER);
    let mut core = core(0, EmulatedVmx::new());

    let mut first = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    let second = Vmcs::new(&allocator, VcpuId(1), &config).unwrap();

    // Everything is zeroed, even though the memory was filled with garbage.
    let mut ranges = Vec::new();
    for vmcs in [&first, &second] {
        for (_, frame) in vmcs.regions().frames().iter() {
            assert!(frame.is_zeroed());
            ranges.push(PhysRange::from(*frame));
        }
        let stack = vmcs.host_stack();
        assert!(memory.is_zeroed(stack.bottom(), stack.size()));
        ranges.push(stack.range());
    }
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
        }
    }

    // The revision identifier fills the first 4 bytes.
    first.pre_initialize_vmcs(&mut core).unwrap();
    let region = first.regions().vmcs.as_ref();
    assert_eq!(region[0..4], 4u32.to_le_bytes());
    assert!(region[4..].iter().all(|byte| *byte == 0));
}

#[test]
fn true_controls() {
    let memory = TestMemory::new(0x20000);
    let config = VcpuConfig::new(EXIT_HANDLER);

    // Without the true MSRs CR3 exiting is mandatory.
    let allocator = memory.range_allocator();
    let mut core_a = core(0, EmulatedVmx::new());
    let mut vmcs = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    vmcs.pre_initialize_vmcs(&mut core_a).unwrap();
    vmcs.initialize_vmcs(&mut core_a, &host_state(), &config)
        .unwrap();
    let primary = core_a.active(&vmcs).unwrap().get_primary_ctrls().unwrap();
    let cr3_exiting = PrimaryControls::CR3_LOAD_EXITING | PrimaryControls::CR3_STORE_EXITING;
    assert!(primary.contains(cr3_exiting));
    vmcs.teardown(&mut core_a, &allocator).unwrap();

    let mut core_b = core(1, EmulatedVmx::with_true_ctls());
    assert!(core_b.vmx_info().support_true_ctls);
    let mut vmcs = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    vmcs.pre_initialize_vmcs(&mut core_b).unwrap();
    vmcs.initialize_vmcs(&mut core_b, &host_state(), &config)
        .unwrap();
    let primary = core_b.active(&vmcs).unwrap().get_primary_ctrls().unwrap();
    assert!(!primary.intersects(cr3_exiting));
}

#[test]
fn optional_fields() {
    let memory = TestMemory::new(0x40000);
    let allocator = memory.range_allocator();
    let mut core = core(0, EmulatedVmx::new());

    // Conservative defaults: no PAT, no virtual-APIC page.
    let config = VcpuConfig::new(EXIT_HANDLER);
    let mut vmcs = Vmcs::new(&allocator, VcpuId(0), &config).unwrap();
    vmcs.pre_initialize_vmcs(&mut core).unwrap();
    vmcs.initialize_vmcs(&mut core, &host_state(), &config)
        .unwrap();
    let written = core.vmx().written();
    assert!(written.contains(&(HostState64::Ia32Efer as u32)));
    assert!(!written.contains(&(HostState64::Ia32Pat as u32)));
    assert!(!written.contains(&(Ctrl64::VirtApicAddr as u32)));
    assert!(!written.contains(&(Ctrl32::SecondaryProcBasedVmExecCtrls as u32)));

    let mut config = VcpuConfig::new(EXIT_HANDLER);
    config.exit = ExitControls::LOAD_IA32_PAT;
    config.primary = PrimaryControls::USE_TPR_SHADOW;
    let mut other = Vmcs::new(&allocator, VcpuId(1), &config).unwrap();
    other.pre_initialize_vmcs(&mut core).unwrap();
    other
        .initialize_vmcs(&mut core, &host_state(), &config)
        .unwrap();
    let ptr = other.vmcs_ptr();
    let vmx = core.vmx();
    assert_eq!(
        vmx.field(ptr, HostState64::Ia32Pat as u32),
        Some(host_state().pat)
    );
    assert_eq!(
        vmx.field(ptr, Ctrl64::VirtApicAddr as u32),
        Some(other.regions().virtual_apic.phys_addr.as_u64())
    );
}
