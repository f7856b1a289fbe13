use camino::Utf8Path;

use crate::error::AssetError;
use crate::handler::{AssetHandler, Capabilities, Payload};
use crate::io;

/// PNG figures. Figures are end products, so this handler cannot read.
#[derive(Debug, Default, Clone, Copy)]
pub struct FigureHandler;

impl FigureHandler {
    pub const NAME: &'static str = "figure";
}

impl AssetHandler for FigureHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::WRITE_ONLY
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        let figure = data.as_figure()?;
        let image = image::GrayImage::from_raw(figure.width, figure.height, figure.pixels.clone())
            .ok_or_else(|| {
                AssetError::serialize(
                    path,
                    format!(
                        "{} pixels do not fill a {}x{} figure",
                        figure.pixels.len(),
                        figure.width,
                        figure.height
                    ),
                )
            })?;

        io::ensure_parent(path)?;
        image
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| match e {
                image::ImageError::IoError(source) => AssetError::Io {
                    path: path.to_owned(),
                    source,
                },
                other => AssetError::serialize(path, other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Access;
    use crate::handler::Figure;
    use camino::Utf8PathBuf;

    #[test]
    fn test_figure_write_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let path = root.join("figures/ps.png");

        let figure = Figure::from_values(3, &[0.0, 0.5, 1.0, 1.0, 0.5, 0.0]);
        FigureHandler.write(&path, &figure.into()).unwrap();
        assert!(path.exists());

        assert!(matches!(
            FigureHandler.read(&path),
            Err(AssetError::Unsupported {
                access: Access::Read,
                ..
            })
        ));
    }
}
