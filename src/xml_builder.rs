use anyhow::Result;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const XMLA_NS: &str = "urn:schemas-microsoft-com:xml-analysis";

/// What goes inside `<Statement>`.
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    /// DAX or DMV text; XML-escaped.
    Query(&'a str),
    /// TMSL JSON; wrapped in CDATA.
    Command(&'a str),
}

fn write_cdata(writer: &mut Writer<Cursor<Vec<u8>>>, text: &str) -> Result<()> {
    // "]]>" cannot appear inside a CDATA section: split it across two sections.
    let mut parts = text.split("]]>").peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_some() {
            writer.write_event(Event::CData(BytesCData::new(format!("{part}]]").as_str())))?;
            writer.write_event(Event::CData(BytesCData::new(">")))?;
        } else {
            writer.write_event(Event::CData(BytesCData::new(part)))?;
        }
    }
    Ok(())
}

fn write_simple(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// Build an XMLA `Execute` SOAP envelope.
pub fn build_execute_envelope(statement: Statement<'_>, catalog: &str) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut envelope = BytesStart::new("soap:Envelope");
    envelope.push_attribute(("xmlns:soap", SOAP_NS));
    writer.write_event(Event::Start(envelope))?;
    writer.write_event(Event::Start(BytesStart::new("soap:Body")))?;

    let mut execute = BytesStart::new("Execute");
    execute.push_attribute(("xmlns", XMLA_NS));
    writer.write_event(Event::Start(execute))?;

    writer.write_event(Event::Start(BytesStart::new("Command")))?;
    writer.write_event(Event::Start(BytesStart::new("Statement")))?;
    match statement {
        Statement::Query(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
        Statement::Command(json) => write_cdata(&mut writer, json)?,
    }
    writer.write_event(Event::End(BytesEnd::new("Statement")))?;
    writer.write_event(Event::End(BytesEnd::new("Command")))?;

    writer.write_event(Event::Start(BytesStart::new("Properties")))?;
    writer.write_event(Event::Start(BytesStart::new("PropertyList")))?;
    write_simple(&mut writer, "Catalog", catalog)?;
    if matches!(statement, Statement::Query(_)) {
        write_simple(&mut writer, "Format", "Tabular")?;
    }
    writer.write_event(Event::End(BytesEnd::new("PropertyList")))?;
    writer.write_event(Event::End(BytesEnd::new("Properties")))?;

    writer.write_event(Event::End(BytesEnd::new("Execute")))?;
    writer.write_event(Event::End(BytesEnd::new("soap:Body")))?;
    writer.write_event(Event::End(BytesEnd::new("soap:Envelope")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}
