#![no_main]

use libfuzzer_sys::fuzz_target;
use minlz_core::BlockIndex;

fuzz_target!(|data: &[u8]| {
    // Malformed trailers must error, never panic.
    let Ok(loaded) = BlockIndex::load(data) else {
        return;
    };

    // Whatever parsed must survive rebuild + reserialize + reload.
    let mut index = BlockIndex::new(1 << 20);
    for entry in &loaded.entries {
        if index
            .add(entry.compressed_offset, entry.uncompressed_offset)
            .is_err()
        {
            return;
        }
    }
    let mut out = Vec::new();
    index.append_to(&mut out, loaded.total_uncompressed, loaded.total_compressed);
    let reloaded = BlockIndex::load(&out).expect("re-serialized trailer must parse");
    assert_eq!(reloaded.total_uncompressed, loaded.total_uncompressed);
    assert_eq!(reloaded.total_compressed, loaded.total_compressed);
    assert_eq!(reloaded.entries, index.entries());
});
