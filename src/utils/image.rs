//! Image utility functions

use image::ImageFormat;

/// File extension for the format sniffed from the magic bytes
pub fn sniff_extension(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::Png) => "png",
        Ok(ImageFormat::Gif) => "gif",
        Ok(ImageFormat::WebP) => "webp",
        Ok(ImageFormat::Bmp) => "bmp",
        _ => "bin",
    }
}

/// Encode image to PNG bytes
#[cfg(test)]
pub fn encode_png(image: &image::DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
