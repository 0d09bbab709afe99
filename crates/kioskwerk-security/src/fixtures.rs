// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sample documents for tests. Compiled only for tests or with the
// `test-fixtures` feature.

use lopdf::dictionary;
use lopdf::{Document, Object, Stream};

/// Build a structurally valid PDF with `pages` pages, padded with PDF
/// comments until it is at least `min_bytes` long.
pub fn pdf_document(pages: u32, min_bytes: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();

    let mut padding = b"q Q\n".to_vec();
    while padding.len() < min_bytes {
        padding.extend_from_slice(b"% kioskwerk fixture padding ........................................\n");
    }

    let mut kids: Vec<Object> = Vec::new();
    for index in 0..pages.max(1) {
        let body = if index == 0 { padding.clone() } else { b"q Q\n".to_vec() };
        let content_id = doc.add_object(Stream::new(dictionary! {}, body));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialise fixture PDF");
    bytes
}

pub fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0, 0, 0, 13, b'I', b'H', b'D', b'R', 0, 0, 0, 1, 0, 0, 0, 1]);
    bytes
}

pub fn jpeg_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    bytes.extend_from_slice(b"JFIF\0");
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    bytes
}

pub fn doc_bytes() -> Vec<u8> {
    let mut bytes = vec![0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
    bytes.extend_from_slice(&[0u8; 24]);
    bytes
}

pub fn docx_bytes() -> Vec<u8> {
    let mut bytes = vec![0x50, 0x4B, 0x03, 0x04];
    bytes.extend_from_slice(b"\x14\x00\x06\x00[Content_Types].xml");
    bytes
}
