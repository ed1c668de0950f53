//! loopfx command-line host.

fn main() -> anyhow::Result<()> {
    loopfx_lib::run()
}
