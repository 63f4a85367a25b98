#[inline(always)]
pub fn relax() {
    core::hint::spin_loop();
}
