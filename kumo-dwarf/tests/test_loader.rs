//! モジュールイメージとシンボル表のテスト
//!
//! テストバイナリ自身を読み込みます。

use kumo_dwarf::{LineTable, ModuleImage, SymbolTable};

#[inline(never)]
#[no_mangle]
pub extern "C" fn kumo_dwarf_loader_marker(x: u64) -> u64 {
    x.wrapping_mul(3)
}

#[test]
fn test_symbol_table_of_test_binary() {
    let exe = std::env::current_exe().expect("current_exe");
    let image = ModuleImage::open(&exe).expect("open test binary");
    assert_eq!(image.path(), exe.as_path());

    let table = SymbolTable::from_image(&image);
    assert!(!table.is_empty());

    let marker = table
        .lookup("kumo_dwarf_loader_marker")
        .expect("marker symbol");
    assert!(marker.is_function);

    let (sym, offset) = table.containing(marker.address).expect("containing");
    assert_eq!(sym.address, marker.address);
    assert_eq!(offset, 0);
    assert_eq!(kumo_dwarf_loader_marker(2), 6);
}

#[test]
fn test_runtime_address_mapping() {
    let exe = std::env::current_exe().expect("current_exe");
    let image = ModuleImage::open(&exe).expect("open test binary");

    if image.is_relocatable() {
        assert_eq!(image.runtime_address(0x5555_0000, 0x1234), 0x5555_1234);
        assert_eq!(image.file_address(0x5555_0000, 0x5555_1234), 0x1234);
    } else {
        assert_eq!(image.runtime_address(0x5555_0000, 0x1234), 0x1234);
    }
}

#[test]
fn test_line_table_for_marker() {
    let exe = std::env::current_exe().expect("current_exe");
    let image = ModuleImage::open(&exe).expect("open test binary");
    let table = SymbolTable::from_image(&image);
    let marker = table.lookup("kumo_dwarf_loader_marker").expect("marker");

    // デバッグ情報なしでビルドされていればNone
    if let Some(lines) = LineTable::from_image(&image).expect("line table") {
        if let Some(loc) = lines.locate(marker.address) {
            assert_eq!(loc.file_name(), "test_loader.rs");
            assert!(loc.line > 0);
        }
    }
}
