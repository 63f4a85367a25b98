/// One poll interval of an SIE handshake spin.
#[inline(always)]
pub fn relax() {
    cortex_m::asm::nop();
}
