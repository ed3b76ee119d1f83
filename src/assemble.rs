//! Artifact assembly: consume the completed chapter set in canonical order
//! and write a TXT or EPUB file under the download directory.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;

use crate::adapter::NovelDetail;
use crate::download::FetchedChapter;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Txt,
    Epub,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(Self::Txt),
            "epub" => Ok(Self::Epub),
            other => Err(Error::input(format!(
                "unsupported format: {other} (expected txt or epub)"
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Epub => "epub",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Txt => "text/plain; charset=utf-8",
            Self::Epub => "application/epub+zip",
        }
    }
}

/// Replace filesystem-hostile characters; an empty result becomes `_`.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

pub fn artifact_filename(title: &str, author: &str, format: OutputFormat) -> String {
    format!(
        "{}_{}.{}",
        sanitize_filename(title),
        sanitize_filename(author),
        format.extension()
    )
}

/// Strip the metadata debris some sites append to chapter headings
/// (author / word count / update-time trailers).
pub fn clean_chapter_title(title: &str) -> String {
    let patterns = [
        r"\s*小说：.*?作者：.*$",
        r"\s*作者：.*?字数：.*$",
        r"\s*字数：\d+.*$",
        r"\s*更新时间\s*[:：]?\s*\d{4}-\d{2}-\d{2}.*$",
        r"\s*\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}(:\d{2})?.*$",
    ];
    let mut cleaned = title.to_string();
    for pattern in patterns {
        if let Ok(regex) = Regex::new(pattern) {
            cleaned = regex.replace(&cleaned, "").into_owned();
        }
    }
    let cleaned = crate::selector::normalize_whitespace(&cleaned);
    if cleaned.is_empty() {
        "未知章节".to_string()
    } else {
        cleaned
    }
}

pub struct Assembler {
    download_dir: PathBuf,
}

impl Assembler {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    /// Write the artifact and verify it is fully materialized. Returns the
    /// final path.
    pub async fn assemble(
        &self,
        detail: &NovelDetail,
        chapters: &[FetchedChapter],
        format: OutputFormat,
    ) -> Result<PathBuf> {
        let path = self
            .download_dir
            .join(artifact_filename(&detail.title, &detail.author, format));

        let detail = detail.clone();
        let chapters = chapters.to_vec();
        let blocking_path = path.clone();
        let download_dir = self.download_dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            fs::create_dir_all(&download_dir)
                .with_context(|| format!("create download dir: {}", download_dir.display()))?;
            match format {
                OutputFormat::Txt => write_txt(&blocking_path, &detail, &chapters),
                OutputFormat::Epub => write_epub(&blocking_path, &detail, &chapters),
            }
        })
        .await
        .map_err(|err| Error::internal(format!("join assembly task: {err}")))?
        .map_err(|err| Error::internal(format!("write artifact: {err:#}")))?;

        verify_artifact(&path, format)
            .map_err(|err| Error::internal(format!("artifact verification: {err:#}")))?;
        Ok(path)
    }
}

fn write_txt(path: &Path, detail: &NovelDetail, chapters: &[FetchedChapter]) -> anyhow::Result<()> {
    let file = fs::File::create(path).with_context(|| format!("create txt: {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);

    writeln!(out, "书名：{}", detail.title)?;
    writeln!(out, "作者：{}", detail.author)?;
    if let Some(intro) = &detail.intro {
        writeln!(out, "简介：{intro}")?;
    }
    writeln!(out, "章节数：{}", chapters.len())?;
    writeln!(out, "{}", "=".repeat(50))?;
    writeln!(out)?;

    for chapter in chapters {
        writeln!(out, "{}", clean_chapter_title(&chapter.title))?;
        writeln!(out)?;
        writeln!(out, "{}", chapter.content)?;
        writeln!(out)?;
    }

    out.flush().context("flush txt")?;
    Ok(())
}

fn write_epub(path: &Path, detail: &NovelDetail, chapters: &[FetchedChapter]) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create epub: {}", path.display()))?;
    let mut zip = zip::ZipWriter::new(file);

    // Per EPUB spec, `mimetype` MUST be the first entry and MUST be stored
    // (no compression).
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;

    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let uuid = uuid::Uuid::new_v4();
    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    zip.start_file("META-INF/container.xml", deflated)
        .context("epub start_file container.xml")?;
    zip.write_all(render_container_xml().as_bytes())
        .context("epub write container.xml")?;

    zip.start_file("OEBPS/content.opf", deflated)
        .context("epub start_file content.opf")?;
    zip.write_all(render_content_opf(detail, uuid, &modified, chapters).as_bytes())
        .context("epub write content.opf")?;

    zip.start_file("OEBPS/nav.xhtml", deflated)
        .context("epub start_file nav.xhtml")?;
    zip.write_all(render_nav_xhtml(&detail.title, chapters).as_bytes())
        .context("epub write nav.xhtml")?;

    zip.start_file("OEBPS/toc.ncx", deflated)
        .context("epub start_file toc.ncx")?;
    zip.write_all(render_toc_ncx(&detail.title, uuid, chapters).as_bytes())
        .context("epub write toc.ncx")?;

    zip.start_file("OEBPS/style.css", deflated)
        .context("epub start_file style.css")?;
    zip.write_all(default_style_css().as_bytes())
        .context("epub write style.css")?;

    for chapter in chapters {
        zip.start_file(format!("OEBPS/{}.xhtml", chapter_stem(chapter.order)), deflated)
            .with_context(|| format!("epub start_file chapter {}", chapter.order))?;
        zip.write_all(render_chapter_xhtml(chapter).as_bytes())
            .with_context(|| format!("epub write chapter {}", chapter.order))?;
    }

    zip.finish().context("epub finish zip")?;
    Ok(())
}

/// The artifact only counts once it is readable and structurally sane:
/// TXT must open with the metadata header, EPUB with the zip magic.
pub fn verify_artifact(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let metadata =
        fs::metadata(path).with_context(|| format!("stat artifact: {}", path.display()))?;
    if metadata.len() == 0 {
        anyhow::bail!("artifact is empty: {}", path.display());
    }
    match format {
        OutputFormat::Txt => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("read artifact: {}", path.display()))?;
            if !content.contains("书名：") {
                anyhow::bail!("txt artifact is missing its header");
            }
        }
        OutputFormat::Epub => {
            let bytes =
                fs::read(path).with_context(|| format!("read artifact: {}", path.display()))?;
            if !bytes.starts_with(b"PK\x03\x04") {
                anyhow::bail!("epub artifact is not a zip container");
            }
        }
    }
    Ok(())
}

fn chapter_stem(order: u32) -> String {
    format!("chapter-{order:04}")
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.8; }
h2 { text-align: center; margin: 1.5em 0 1em; }
p { text-indent: 2em; margin: 0.4em 0; }
"#
    .to_string()
}

fn render_content_opf(
    detail: &NovelDetail,
    uuid: uuid::Uuid,
    modified: &str,
    chapters: &[FetchedChapter],
) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"zh\">\n",
    );
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">urn:uuid:{}</dc:identifier>\n",
        xml_escape(&uuid.to_string())
    ));
    out.push_str(&format!(
        "    <dc:title>{}</dc:title>\n",
        xml_escape(&detail.title)
    ));
    out.push_str(&format!(
        "    <dc:creator>{}</dc:creator>\n",
        xml_escape(&detail.author)
    ));
    out.push_str("    <dc:language>zh</dc:language>\n");
    if let Some(intro) = &detail.intro {
        out.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(intro)
        ));
    }
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    for chapter in chapters {
        let stem = chapter_stem(chapter.order);
        out.push_str(&format!(
            "    <item id=\"{stem}\" href=\"{stem}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
        ));
    }
    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    for chapter in chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            chapter_stem(chapter.order)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn render_nav_xhtml(title: &str, chapters: &[FetchedChapter]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"zh\" xml:lang=\"zh\">\n",
    );
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    for chapter in chapters {
        out.push_str(&format!(
            "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
            chapter_stem(chapter.order),
            xml_escape(&clean_chapter_title(&chapter.title))
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(title: &str, uuid: uuid::Uuid, chapters: &[FetchedChapter]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"urn:uuid:{}\" />\n",
        xml_escape(&uuid.to_string())
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <navMap>\n");
    for chapter in chapters {
        let play = chapter.order;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&clean_chapter_title(&chapter.title)));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}.xhtml\" />\n",
            chapter_stem(chapter.order)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_chapter_xhtml(chapter: &FetchedChapter) -> String {
    let title = clean_chapter_title(&chapter.title);
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str("<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"zh\" xml:lang=\"zh\">\n");
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(&title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h2>{}</h2>\n", xml_escape(&title)));
    for paragraph in chapter.content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        out.push_str(&format!("  <p>{}</p>\n", xml_escape(paragraph)));
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
